use std::io;
use std::path::Path;

use tracing::warn;

use crate::scope::Scope;

pub trait StorageProbe {
    fn free_space(&self, path: &Path) -> io::Result<u64>;
}

/// Free space as reported by `statvfs` for the filesystem holding the path.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl StorageProbe for StatvfsProbe {
    #[cfg(unix)]
    fn free_space(&self, path: &Path) -> io::Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
        #[allow(clippy::unnecessary_cast)]
        let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        Ok(available)
    }

    #[cfg(not(unix))]
    fn free_space(&self, _path: &Path) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "free space query is not supported on this platform",
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceCheck {
    Sufficient,
    Insufficient { required: u64, available: u64 },
    /// The query failed; the check is advisory so callers proceed.
    Unknown,
}

/// Admission check run before an install or update pulls data into `scope`.
pub fn check_free_space(
    probe: &dyn StorageProbe,
    scope: &Scope,
    download_size: u64,
    min_headroom: u64,
) -> SpaceCheck {
    let available = match probe.free_space(&scope.path) {
        Ok(available) => available,
        Err(err) => {
            warn!(
                "failed to query free space for scope '{}' at {}: {err}",
                scope.name,
                scope.path.display()
            );
            return SpaceCheck::Unknown;
        }
    };

    let required = download_size.saturating_add(min_headroom);
    if required > available {
        return SpaceCheck::Insufficient {
            required,
            available,
        };
    }
    SpaceCheck::Sufficient
}
