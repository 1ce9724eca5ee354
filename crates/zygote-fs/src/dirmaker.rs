//! Issues unique subdirectories under a private base directory

use log::warn;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use zygote_core::Result;

/// Hands out fresh subdirectories under one 0700 base dir. Names are
/// made unique with a monotonic counter suffix, so two callers asking
/// for the same name never collide.
pub struct DirMaker {
    base: PathBuf,
    next: AtomicU64,
}

impl DirMaker {
    /// Create `<parent>/<name>` (mode 0700) as the base directory
    pub fn new(parent: &Path, name: &str) -> Result<Self> {
        let base = parent.join(name);
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&base)?;
        Ok(Self {
            base,
            next: AtomicU64::new(0),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Issue a fresh subdirectory. The returned path exists.
    pub fn make(&self, name: &str) -> Result<PathBuf> {
        let seq = self.next.fetch_add(1, Ordering::SeqCst);
        let dir = self.base.join(format!("{}-{}", name, seq));
        fs::create_dir(&dir)?;
        Ok(dir)
    }

    /// Remove the base directory and everything issued from it
    pub fn destroy(&self) {
        if let Err(e) = fs::remove_dir_all(&self.base) {
            warn!("failed to remove {}: {}", self.base.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    #[test]
    fn test_base_created_private() {
        let tmp = tempdir().unwrap();
        let maker = DirMaker::new(tmp.path(), "root").unwrap();
        let mode = fs::metadata(maker.base()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_same_name_gets_distinct_dirs() {
        let tmp = tempdir().unwrap();
        let maker = DirMaker::new(tmp.path(), "scratch").unwrap();
        let a = maker.make("sb").unwrap();
        let b = maker.make("sb").unwrap();
        assert_ne!(a, b);
        assert!(a.is_dir());
        assert!(b.is_dir());
    }

    #[test]
    fn test_destroy_removes_everything() {
        let tmp = tempdir().unwrap();
        let maker = DirMaker::new(tmp.path(), "code").unwrap();
        let issued = maker.make("sb").unwrap();
        let base = maker.base().to_path_buf();
        maker.destroy();
        assert!(!issued.exists());
        assert!(!base.exists());
    }
}
