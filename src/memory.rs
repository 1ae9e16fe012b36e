//! Physical-memory gauge backing memory-cache admission.

use std::sync::OnceLock;

use parking_lot::Mutex;
use sysinfo::System;

/// Source of physical-memory figures used when deciding whether a chunk may
/// be mirrored into memory.
pub trait MemoryInfo: Send + Sync {
    /// Total physical memory in MiB.
    fn total_physical_mb(&self) -> u64;
    /// Share of physical memory currently in use, 0.0-100.0.
    fn used_percent(&self) -> f64;
}

/// `MemoryInfo` over the running system.
pub struct SystemMemory {
    system: Mutex<System>,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryInfo for SystemMemory {
    fn total_physical_mb(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.total_memory() / (1024 * 1024)
    }

    fn used_percent(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return 100.0;
        }
        system.used_memory() as f64 * 100.0 / total as f64
    }
}

/// Process-wide gauge used by chunks.
pub(crate) fn system() -> &'static SystemMemory {
    static GAUGE: OnceLock<SystemMemory> = OnceLock::new();
    GAUGE.get_or_init(SystemMemory::new)
}

/// Decides whether a chunk of `chunk_size_mb` may be cached: always when
/// forced, otherwise only while projected usage stays within `max_percent`
/// of physical memory.
pub(crate) fn admit_chunk_cache(
    gauge: &dyn MemoryInfo,
    chunk_size_mb: u64,
    max_percent: u8,
    force: bool,
) -> bool {
    if force {
        return true;
    }
    let total_mb = gauge.total_physical_mb();
    let used_mb = (total_mb as f64 * gauge.used_percent() / 100.0).ceil() as u64;
    used_mb + chunk_size_mb <= total_mb * u64::from(max_percent) / 100
}
