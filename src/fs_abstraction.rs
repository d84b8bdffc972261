//! Filesystem abstraction layer for testability.
//!
//! The daemon only ever reads from disk: the target list, the YAML config
//! and the broker certificate material. Routing those reads through
//! [`FileSystem`] lets the registry and the credential loader be tested
//! with `mockall` instead of real files.

use std::io;
use std::path::Path;

#[cfg(test)]
use mockall::automock;

/// Read-only filesystem operations used by curfew.
///
/// ```ignore
/// let mut fs = MockFileSystem::new();
/// fs.expect_read_text().returning(|_| Ok("10.0.0.5\n".to_string()));
/// let registry = TargetRegistry::load_with("/etc/curfew/target_ips.txt", Arc::new(fs))?;
/// ```
#[cfg_attr(test, automock)]
pub trait FileSystem: Send + Sync {
    /// UTF-8 contents (target list, config).
    fn read_text(&self, path: &Path) -> io::Result<String>;

    /// Raw contents (PEM material).
    fn read_bytes(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Whether `path` names a regular file.
    fn is_file(&self, path: &Path) -> bool;
}

/// Disk-backed [`FileSystem`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn read_text(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn read_bytes(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }
}

static DISK: RealFileSystem = RealFileSystem;

pub fn real_fs() -> &'static RealFileSystem {
    &DISK
}
