use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::SyncError;
use crate::payload::POST_UPDATE_HOOK;
use crate::repository::{RepositoryDescriptor, RepositoryId};
use crate::store::StoreOpener;

/// Derived caches that reference repository content.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate_repository(&self, repo: &RepositoryId) -> Result<(), SyncError>;

    fn clear_all(&self) -> Result<(), SyncError>;
}

/// Caches kept as one subdirectory per repository under a root.
#[derive(Debug, Clone)]
pub struct DirectoryCache {
    root: PathBuf,
}

impl DirectoryCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn remove(path: &Path) -> Result<(), SyncError> {
        let result = if path.is_dir() {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::local(path, e)),
        }
    }
}

impl CacheInvalidator for DirectoryCache {
    fn invalidate_repository(&self, repo: &RepositoryId) -> Result<(), SyncError> {
        Self::remove(&self.root.join(repo.as_str()))
    }

    fn clear_all(&self) -> Result<(), SyncError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(SyncError::local(&self.root, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| SyncError::local(&self.root, e))?;
            Self::remove(&entry.path())?;
        }
        Ok(())
    }
}

/// Run the repository's post-update script, if it ships one.
///
/// Invoked as `/bin/sh <script> <repo> <system root>/ <branch>`. Returns the
/// exit code, or `None` when there is no script.
pub async fn run_post_update_script(
    repo: &RepositoryDescriptor,
    system_root: &Path,
) -> Result<Option<i32>, SyncError> {
    let script = repo.local_path.join(POST_UPDATE_HOOK);
    if !script.is_file() {
        return Ok(None);
    }

    let mut root = system_root.to_string_lossy().into_owned();
    if !root.ends_with('/') {
        root.push('/');
    }

    tracing::info!(repository = %repo.id, script = %script.display(), "running post-update hook");
    let status = tokio::process::Command::new("/bin/sh")
        .arg(&script)
        .arg(repo.id.as_str())
        .arg(&root)
        .arg(&repo.branch)
        .current_dir(&repo.local_path)
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| SyncError::local(&script, e))?;

    Ok(Some(status.code().unwrap_or(-1)))
}

/// Checks whether a newer build of the sync client itself was published.
#[async_trait::async_trait]
pub trait SelfUpdateProbe: Send + Sync {
    /// A notice to show the user, or `None` when up to date.
    async fn check(&self, updated: &[&RepositoryDescriptor]) -> Option<String>;
}

/// Looks up the client's own package atom in the freshly synced stores.
pub struct StoreSelfUpdateProbe {
    opener: Arc<dyn StoreOpener>,
    package: String,
    current_version: String,
}

impl StoreSelfUpdateProbe {
    pub fn new(
        opener: Arc<dyn StoreOpener>,
        package: impl Into<String>,
        current_version: impl Into<String>,
    ) -> Self {
        Self {
            opener,
            package: package.into(),
            current_version: current_version.into(),
        }
    }

    fn published_version(&self, repo: &RepositoryDescriptor) -> Option<String> {
        let prefix = format!("{}-", self.package);
        let store = self.opener.open(&repo.database_path()).ok()?;
        let atoms = store.find_atoms(&prefix).unwrap_or_default();
        let _ = store.close();
        atoms
            .into_iter()
            .filter_map(|atom| atom.strip_prefix(&prefix).map(str::to_string))
            .filter(|version| version.starts_with(|c: char| c.is_ascii_digit()))
            .max_by(|a, b| compare_versions(a, b))
    }
}

/// Order package versions segment by segment (`1.9 < 1.10`, `1.2 < 1.2-r1`).
/// Numeric segments compare as numbers, anything else as text.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let segments = |v: &str| {
        v.split(['.', '-', '_'])
            .map(str::to_owned)
            .collect::<Vec<_>>()
    };
    let (left, right) = (segments(a), segments(b));
    for (l, r) in left.iter().zip(&right) {
        let order = match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(l), Ok(r)) => l.cmp(&r),
            _ => l.cmp(r),
        };
        if order != Ordering::Equal {
            return order;
        }
    }
    left.len().cmp(&right.len())
}

#[async_trait::async_trait]
impl SelfUpdateProbe for StoreSelfUpdateProbe {
    async fn check(&self, updated: &[&RepositoryDescriptor]) -> Option<String> {
        let published = updated
            .iter()
            .filter_map(|repo| self.published_version(repo))
            .max_by(|a, b| compare_versions(a, b))?;
        (compare_versions(&published, &self.current_version) == Ordering::Greater).then(|| {
            format!(
                "{}-{published} is available (running {})",
                self.package, self.current_version
            )
        })
    }
}
