use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::error::{ChunkError, ChunkResult};
use crate::format::RECORD_FRAME_OVERHEAD;

/// Default size of a variable-record data region (256 MiB).
const DEFAULT_CHUNK_DATA_SIZE: u32 = 256 * 1024 * 1024;

/// Default upper bound on a single record's payload (4 MiB).
const DEFAULT_MAX_LOG_RECORD_SIZE: u32 = 4 * 1024 * 1024;

/// Default number of pooled read handles per chunk.
const DEFAULT_CHUNK_READER_COUNT: u16 = 8;

/// Default share of physical memory the chunk cache may grow into.
const DEFAULT_CACHE_MAX_PERCENT: u8 = 75;

/// Record layout selected at chunk construction; mutually exclusive.
///
/// Variable chunks store length-prefixed-and-suffixed frames; fixed chunks
/// store back-to-back records of exactly `unit_size` bytes with no framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordLayout {
    /// Variable-length records inside a data region of `data_size` bytes.
    Variable { data_size: u32 },
    /// Exactly `count` records of `unit_size` bytes each.
    Fixed { unit_size: u32, count: u32 },
}

impl RecordLayout {
    /// Planned capacity of the data region in bytes.
    #[inline]
    pub fn data_total_size(&self) -> u32 {
        match *self {
            RecordLayout::Variable { data_size } => data_size,
            RecordLayout::Fixed { unit_size, count } => unit_size.saturating_mul(count),
        }
    }

    #[inline]
    pub fn is_fixed(&self) -> bool {
        matches!(self, RecordLayout::Fixed { .. })
    }

    /// Record size in fixed mode, `None` for variable chunks.
    #[inline]
    pub fn unit_size(&self) -> Option<u32> {
        match *self {
            RecordLayout::Fixed { unit_size, .. } => Some(unit_size),
            RecordLayout::Variable { .. } => None,
        }
    }
}

impl Default for RecordLayout {
    fn default() -> Self {
        RecordLayout::Variable {
            data_size: DEFAULT_CHUNK_DATA_SIZE,
        }
    }
}

/// Primary configuration surface for a chunk. Immutable after construction.
///
/// The same configuration must be supplied when a chunk file is re-opened;
/// the stored header is cross-checked against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Record layout and data-region sizing.
    pub layout: RecordLayout,

    /// Upper bound on a single record's payload in bytes (variable mode).
    pub max_log_record_size: u32,

    /// Number of pooled read handles opened per chunk.
    pub chunk_reader_count: u16,

    /// Memory-cache admission ceiling: caching a chunk is allowed while
    /// projected used memory stays at or below this percentage of physical
    /// memory. 0 disables caching unless `force_cache_chunk` is set.
    pub message_chunk_cache_max_percent: u8,

    /// Cache chunks in memory unconditionally, ignoring the memory budget.
    pub force_cache_chunk: bool,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            layout: RecordLayout::default(),
            max_log_record_size: DEFAULT_MAX_LOG_RECORD_SIZE,
            chunk_reader_count: DEFAULT_CHUNK_READER_COUNT,
            message_chunk_cache_max_percent: DEFAULT_CACHE_MAX_PERCENT,
            force_cache_chunk: false,
        }
    }
}

impl ChunkConfig {
    /// Planned capacity of the data region in bytes.
    #[inline]
    pub fn data_total_size(&self) -> u32 {
        self.layout.data_total_size()
    }

    /// Validates the configuration, returning it unchanged on success.
    pub fn validated(self) -> ChunkResult<Self> {
        match self.layout {
            RecordLayout::Variable { data_size } => {
                if data_size == 0 {
                    return Err(ChunkError::invalid_config("chunk_data_size must be > 0"));
                }
                if self.max_log_record_size == 0 {
                    return Err(ChunkError::invalid_config("max_log_record_size must be > 0"));
                }
                let framed = self
                    .max_log_record_size
                    .checked_add(RECORD_FRAME_OVERHEAD)
                    .ok_or_else(|| {
                        ChunkError::invalid_config("max_log_record_size overflows frame size")
                    })?;
                if framed > data_size {
                    return Err(ChunkError::invalid_config(
                        "max_log_record_size does not fit the chunk data region",
                    ));
                }
            }
            RecordLayout::Fixed { unit_size, count } => {
                if unit_size == 0 || count == 0 {
                    return Err(ChunkError::invalid_config(
                        "chunk_data_unit_size and chunk_data_count must be > 0",
                    ));
                }
                if unit_size.checked_mul(count).is_none() {
                    return Err(ChunkError::invalid_config(
                        "chunk_data_unit_size * chunk_data_count overflows",
                    ));
                }
            }
        }

        if self.chunk_reader_count == 0 {
            return Err(ChunkError::invalid_config("chunk_reader_count must be >= 1"));
        }
        if self.message_chunk_cache_max_percent > 100 {
            return Err(ChunkError::invalid_config(
                "message_chunk_cache_max_percent must be within 0-100",
            ));
        }

        Ok(self)
    }
}

impl Display for ChunkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChunkConfig(layout={:?}, max_log_record_size={}, chunk_reader_count={}, message_chunk_cache_max_percent={}, force_cache_chunk={})",
            self.layout,
            self.max_log_record_size,
            self.chunk_reader_count,
            self.message_chunk_cache_max_percent,
            self.force_cache_chunk
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ChunkConfig::default().validated().expect("valid");
        assert!(!cfg.layout.is_fixed());
        assert_eq!(cfg.data_total_size(), DEFAULT_CHUNK_DATA_SIZE);
        assert!(cfg.chunk_reader_count >= 1);
        assert!(cfg.message_chunk_cache_max_percent <= 100);
    }

    #[test]
    fn fixed_layout_capacity_is_unit_times_count() {
        let cfg = ChunkConfig {
            layout: RecordLayout::Fixed {
                unit_size: 16,
                count: 4,
            },
            ..ChunkConfig::default()
        };
        assert_eq!(cfg.data_total_size(), 64);
        assert_eq!(cfg.layout.unit_size(), Some(16));
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let cfg = ChunkConfig {
            layout: RecordLayout::Variable { data_size: 0 },
            ..ChunkConfig::default()
        };
        assert!(cfg.validated().is_err());

        let cfg = ChunkConfig {
            layout: RecordLayout::Fixed {
                unit_size: 0,
                count: 4,
            },
            ..ChunkConfig::default()
        };
        assert!(cfg.validated().is_err());
    }

    #[test]
    fn oversized_record_bound_is_rejected() {
        let cfg = ChunkConfig {
            layout: RecordLayout::Variable { data_size: 1024 },
            max_log_record_size: 2048,
            ..ChunkConfig::default()
        };
        assert!(cfg.validated().is_err());
    }

    #[test]
    fn reader_count_and_percent_bounds() {
        let cfg = ChunkConfig {
            chunk_reader_count: 0,
            ..ChunkConfig::default()
        };
        assert!(cfg.validated().is_err());

        let cfg = ChunkConfig {
            message_chunk_cache_max_percent: 101,
            ..ChunkConfig::default()
        };
        assert!(cfg.validated().is_err());
    }

    #[test]
    fn serde_round_trip() {
        let cfg = ChunkConfig {
            layout: RecordLayout::Fixed {
                unit_size: 64,
                count: 1024,
            },
            force_cache_chunk: true,
            ..ChunkConfig::default()
        };
        let json = serde_json::to_string(&cfg).expect("serialize");
        let decoded: ChunkConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(cfg, decoded);
    }
}
