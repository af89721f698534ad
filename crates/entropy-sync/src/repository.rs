use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::payload::{CompressionFormat, DATABASE_FILE, PayloadKind, REVISION_FILE};

/// Stable identifier of a package repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryId(String);

impl RepositoryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote differential service endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub host: String,
    pub port: u16,
}

impl ServiceEndpoint {
    pub const DEFAULT_PORT: u16 = 1026;
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One configured package repository. Read-only during a pass except for the
/// on-disk revision marker.
#[derive(Debug, Clone)]
pub struct RepositoryDescriptor {
    pub id: RepositoryId,
    pub description: String,
    /// Metadata mirrors in priority order.
    pub metadata_mirrors: Vec<String>,
    pub package_mirrors: Vec<String>,
    /// Directory holding the metadata store and its revision marker.
    pub local_path: PathBuf,
    pub branch: String,
    pub product: String,
    pub arch: String,
    pub compression: CompressionFormat,
    pub service: Option<ServiceEndpoint>,
    /// Treat missing or invalid signatures as failures.
    pub require_signature: bool,
}

impl RepositoryDescriptor {
    /// Default local directory: `<root>/<repo>/<product>/<arch>/<branch>`.
    pub fn default_local_path(
        root: &Path,
        id: &RepositoryId,
        product: &str,
        arch: &str,
        branch: &str,
    ) -> PathBuf {
        root.join(id.as_str()).join(product).join(arch).join(branch)
    }

    /// Remote database directory on a mirror: `<mirror>/<product>/<repo>/database/<arch>/<branch>`.
    pub fn database_url(&self, mirror: &str) -> String {
        format!(
            "{}/{}/{}/database/{}/{}",
            mirror.trim_end_matches('/'),
            self.product,
            self.id,
            self.arch,
            self.branch
        )
    }

    pub fn remote_url(&self, mirror: &str, kind: PayloadKind) -> String {
        self.remote_file_url(mirror, &kind.file_name(self.compression))
    }

    pub fn remote_file_url(&self, mirror: &str, file_name: &str) -> String {
        format!("{}/{}", self.database_url(mirror), file_name)
    }

    pub fn local_file(&self, kind: PayloadKind) -> PathBuf {
        self.local_path.join(kind.file_name(self.compression))
    }

    pub fn database_path(&self) -> PathBuf {
        self.local_path.join(DATABASE_FILE)
    }

    pub fn revision_path(&self) -> PathBuf {
        self.local_path.join(REVISION_FILE)
    }

    /// Last synced revision, or `None` when the marker is missing or unreadable.
    pub fn local_revision(&self) -> Option<u64> {
        let raw = std::fs::read_to_string(self.revision_path()).ok()?;
        parse_revision(&raw)
    }

    /// Replace the revision marker atomically.
    pub fn write_revision(&self, revision: u64) -> Result<(), SyncError> {
        let path = self.revision_path();
        let mut tmp = tempfile::NamedTempFile::new_in(&self.local_path)
            .map_err(|e| SyncError::local(&self.local_path, e))?;
        writeln!(tmp, "{revision}").map_err(|e| SyncError::local(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| SyncError::local(&path, e.error))?;
        Ok(())
    }
}

/// Parse a revision marker: a single non-negative integer, surrounding whitespace allowed.
pub fn parse_revision(raw: &str) -> Option<u64> {
    raw.split_whitespace().next()?.parse().ok()
}
