//! Target registry: the addresses subject to "block all" / "unblock all".
//!
//! The registry is loaded from a flat text file, one IPv4 address per line.
//! Blank lines and lines starting with `#` are ignored. The file is the only
//! source of truth; the command protocol never adds or removes targets.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::fs_abstraction::{real_fs, FileSystem};
use crate::validation::{is_wildcard, validate_ipv4};

/// Ordered, de-duplicated list of target addresses.
pub struct TargetRegistry {
    path: Option<PathBuf>,
    fs: Arc<dyn FileSystem>,
    targets: RwLock<Vec<Ipv4Addr>>,
}

impl TargetRegistry {
    /// Load the registry from `path` using the real filesystem.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_with(path, Arc::new(*real_fs()))
    }

    /// Load the registry from `path` through an injected filesystem.
    pub fn load_with<P: AsRef<Path>>(path: P, fs: Arc<dyn FileSystem>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let targets = read_targets(fs.as_ref(), &path)?;
        if targets.is_empty() {
            warn!("No target addresses found in {:?}", path);
        } else {
            info!("Loaded {} target addresses from {:?}", targets.len(), path);
        }

        Ok(Self {
            path: Some(path),
            fs,
            targets: RwLock::new(targets),
        })
    }

    /// Build a registry from an in-memory list (no backing file).
    pub fn from_targets(targets: Vec<Ipv4Addr>) -> Self {
        Self {
            path: None,
            fs: Arc::new(*real_fs()),
            targets: RwLock::new(dedup(targets)),
        }
    }

    /// Re-read the backing file.
    ///
    /// On failure the previous contents are kept and the error is returned.
    pub fn reload(&self) -> Result<usize> {
        let Some(path) = self.path.as_deref() else {
            return Ok(self.len());
        };

        let targets = read_targets(self.fs.as_ref(), path)?;
        let count = targets.len();
        *self.targets.write().unwrap_or_else(|e| e.into_inner()) = targets;
        info!("Reloaded {} target addresses from {:?}", count, path);
        Ok(count)
    }

    /// Copy of the current contents, in file order.
    pub fn snapshot(&self) -> Vec<Ipv4Addr> {
        self.targets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.targets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&addr)
    }

    pub fn len(&self) -> usize {
        self.targets.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn read_targets(fs: &dyn FileSystem, path: &Path) -> Result<Vec<Ipv4Addr>> {
    let content = fs
        .read_text(path)
        .with_context(|| format!("Failed to read target file: {:?}", path))?;
    Ok(parse_targets(&content))
}

/// Parse target file contents.
///
/// Invalid lines and the wildcard address are skipped with a warning;
/// duplicates keep their first position.
pub fn parse_targets(content: &str) -> Vec<Ipv4Addr> {
    let mut targets = Vec::new();

    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match validate_ipv4(line) {
            Ok(addr) if is_wildcard(addr) => {
                warn!("Line {}: wildcard address is not a valid target", lineno + 1);
            }
            Ok(addr) => targets.push(addr),
            Err(e) => warn!("Line {}: {}", lineno + 1, e),
        }
    }

    dedup(targets)
}

fn dedup(targets: Vec<Ipv4Addr>) -> Vec<Ipv4Addr> {
    let mut seen = HashSet::new();
    targets.into_iter().filter(|a| seen.insert(*a)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_abstraction::MockFileSystem;
    use std::io;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_targets_skips_comments_and_blanks() {
        let content = "# kids' devices\n10.0.0.5\n\n   \n  10.0.0.6  \n#10.0.0.7\n";
        assert_eq!(parse_targets(content), vec![ip("10.0.0.5"), ip("10.0.0.6")]);
    }

    #[test]
    fn test_parse_targets_skips_invalid_lines() {
        let content = "10.0.0.5\nnot-an-ip\n10.0.0.300\n::1\n0.0.0.0\n10.0.0.6\n";
        assert_eq!(parse_targets(content), vec![ip("10.0.0.5"), ip("10.0.0.6")]);
    }

    #[test]
    fn test_parse_targets_dedups_keeping_order() {
        let content = "10.0.0.6\n10.0.0.5\n10.0.0.6\n";
        assert_eq!(parse_targets(content), vec![ip("10.0.0.6"), ip("10.0.0.5")]);
    }

    #[test]
    fn test_parse_targets_byte_order_mark() {
        let content = "\u{feff}10.0.0.5\r\n10.0.0.6\r\n";
        assert_eq!(parse_targets(content), vec![ip("10.0.0.5"), ip("10.0.0.6")]);
    }

    #[test]
    fn test_parse_targets_empty() {
        assert!(parse_targets("").is_empty());
        assert!(parse_targets("# nothing here\n").is_empty());
    }

    #[test]
    fn test_load_with_mock_fs() {
        let mut mock = MockFileSystem::new();
        mock.expect_read_text()
            .withf(|p| p == Path::new("/etc/curfew/target_ips.txt"))
            .times(1)
            .returning(|_| Ok("10.0.0.5\n10.0.0.6\n".to_string()));

        let registry =
            TargetRegistry::load_with("/etc/curfew/target_ips.txt", Arc::new(mock)).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(ip("10.0.0.5")));
        assert!(!registry.contains(ip("10.0.0.9")));
    }

    #[test]
    fn test_load_unreadable_file_fails() {
        let mut mock = MockFileSystem::new();
        mock.expect_read_text()
            .returning(|_| Err(io::Error::new(io::ErrorKind::NotFound, "missing")));

        let result = TargetRegistry::load_with("/missing.txt", Arc::new(mock));
        assert!(result.is_err());
    }

    #[test]
    fn test_reload_keeps_previous_on_failure() {
        let mut mock = MockFileSystem::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_read_text()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok("10.0.0.5\n".to_string()));
        mock.expect_read_text()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied")));
        mock.expect_read_text()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok("10.0.0.7\n10.0.0.8\n".to_string()));

        let registry = TargetRegistry::load_with("/targets.txt", Arc::new(mock)).unwrap();
        assert_eq!(registry.snapshot(), vec![ip("10.0.0.5")]);

        assert!(registry.reload().is_err());
        assert_eq!(registry.snapshot(), vec![ip("10.0.0.5")]);

        assert_eq!(registry.reload().unwrap(), 2);
        assert_eq!(registry.snapshot(), vec![ip("10.0.0.7"), ip("10.0.0.8")]);
    }

    #[test]
    fn test_from_targets_has_no_path() {
        let registry = TargetRegistry::from_targets(vec![ip("10.0.0.5"), ip("10.0.0.5")]);
        assert!(registry.path().is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.reload().unwrap(), 1);
    }

    #[test]
    fn test_load_real_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("target_ips.txt");
        std::fs::write(&path, "192.168.1.20\n192.168.1.21\n").unwrap();

        let registry = TargetRegistry::load(&path).unwrap();
        assert_eq!(registry.path(), Some(path.as_path()));
        assert_eq!(registry.len(), 2);
    }
}
