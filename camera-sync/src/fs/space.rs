//! Free-space probing for the reserved disk floor.

use std::path::Path;

/// Reports bytes available to unprivileged writers on the filesystem holding `path`.
pub trait FreeSpaceProbe: Send + Sync {
    fn available_bytes(&self, path: &Path) -> std::io::Result<u64>;
}

/// `statvfs(3)` backed probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl FreeSpaceProbe for StatvfsProbe {
    fn available_bytes(&self, path: &Path) -> std::io::Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(std::io::Error::from)?;
        Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
    }
}

/// Fixed answer, for tests and dry runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedSpace(pub u64);

impl FreeSpaceProbe for FixedSpace {
    fn available_bytes(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.0)
    }
}

/// True when writing `needed` bytes would leave less than `floor` available.
pub fn violates_floor(available: u64, needed: u64, floor: u64) -> bool {
    available < needed.saturating_add(floor)
}
