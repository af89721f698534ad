use std::path::{Path, PathBuf};

/// Local files created during one repository's pass.
///
/// Anything still tracked when the set is discarded or dropped is removed,
/// so failed passes leave nothing behind.
#[derive(Debug, Default)]
pub struct ArtifactSet {
    paths: Vec<PathBuf>,
}

impl ArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    /// Stop tracking a path that now belongs to the installed state.
    pub fn release(&mut self, path: &Path) {
        self.paths.retain(|p| p != path);
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.iter().any(|p| p == path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Remove every tracked file and directory.
    pub fn discard(&mut self) {
        for path in self.paths.drain(..) {
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => tracing::debug!(path = %path.display(), "removed artifact"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), "cannot remove artifact: {e}"),
            }
        }
    }
}

impl Drop for ArtifactSet {
    fn drop(&mut self) {
        self.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discard_removes_tracked_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let tracked = dir.path().join("packages.db.light.bz2");
        let released = dir.path().join("packages.db");
        std::fs::write(&tracked, b"x").unwrap();
        std::fs::write(&released, b"y").unwrap();

        let mut artifacts = ArtifactSet::new();
        artifacts.track(&tracked);
        artifacts.track(&released);
        artifacts.track(&tracked);
        assert_eq!(artifacts.len(), 2);
        artifacts.release(&released);
        artifacts.discard();

        assert!(!tracked.exists());
        assert!(released.exists());
        assert!(artifacts.is_empty());
    }

    #[test]
    fn drop_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("staging");
        std::fs::create_dir(&staged).unwrap();
        std::fs::write(staged.join("notice.rss"), b"x").unwrap();
        {
            let mut artifacts = ArtifactSet::new();
            artifacts.track(&staged);
            artifacts.track(dir.path().join("never-created"));
        }
        assert!(!staged.exists());
    }
}
