use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use entropy_sync::{
    CompressionFormat, ProtocolTier, RepositoryDescriptor, RepositoryId, ServiceEndpoint,
    SyncSettings, Timeouts,
};
use serde::{Deserialize, Serialize};

/// Environment variable pinning the protocol tier for one run.
pub const FORCE_TIER_ENV: &str = "FORCE_EAPI";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// `repositories.toml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub branch: String,
    pub product: String,
    pub arch: String,
    pub developer_mode: bool,
    pub gpg: bool,
    pub database_root: PathBuf,
    pub cache_dir: PathBuf,
    pub lock_file: PathBuf,
    /// Per-repository GnuPG keyrings.
    pub gpg_home: PathBuf,
    pub timeouts: TimeoutConfig,
    pub repositories: Vec<RepositoryEntry>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let defaults = SyncSettings::default();
        Self {
            branch: defaults.branch,
            product: defaults.product,
            arch: defaults.arch,
            developer_mode: false,
            gpg: true,
            database_root: PathBuf::from("/var/lib/entropy/client/database"),
            cache_dir: PathBuf::from("/var/lib/entropy/caches"),
            lock_file: PathBuf::from("/var/lib/entropy/.sync.lock"),
            gpg_home: PathBuf::from("/var/lib/entropy/client/gpg_keys"),
            timeouts: TimeoutConfig::default(),
            repositories: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub control_secs: u64,
    pub transfer_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let defaults = Timeouts::default();
        Self {
            control_secs: defaults.control.as_secs(),
            transfer_secs: defaults.transfer.as_secs(),
        }
    }
}

/// One `[[repositories]]` table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RepositoryEntry {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub metadata_mirrors: Vec<String>,
    /// Defaults to the metadata mirrors.
    #[serde(default)]
    pub package_mirrors: Vec<String>,
    #[serde(default)]
    pub compression: CompressionFormat,
    pub service: Option<ServiceEntry>,
    #[serde(default)]
    pub require_signature: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides the directory derived from `database_root`.
    pub local_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceEntry {
    pub host: String,
    #[serde(default = "default_service_port")]
    pub port: u16,
}

fn default_true() -> bool {
    true
}

fn default_service_port() -> u16 {
    ServiceEndpoint::DEFAULT_PORT
}

/// Config file path: `~/.config/entropy/repositories.toml`
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("entropy").join("repositories.toml"))
}

/// Load the config. An explicitly named file must exist; a missing default
/// file means no repositories are configured.
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(AppConfig::default()),
        },
    };
    let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    parse_config(&contents, &path)
}

pub fn parse_config(contents: &str, path: &Path) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}

impl AppConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for repo in &self.repositories {
            if repo.id.trim().is_empty() {
                return Err(ConfigError::Invalid("repository with empty id".into()));
            }
            if !seen.insert(repo.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "repository `{}` is declared twice",
                    repo.id
                )));
            }
            if repo.metadata_mirrors.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "repository `{}` has no metadata mirrors",
                    repo.id
                )));
            }
        }
        Ok(())
    }

    /// Global knobs for this run. `forced` is the raw `FORCE_EAPI` value.
    pub fn settings(&self, forced: Option<&str>) -> Result<SyncSettings, ConfigError> {
        let forced_tier = forced
            .map(|raw| {
                ProtocolTier::parse_override(raw).ok_or_else(|| {
                    ConfigError::Invalid(format!("{FORCE_TIER_ENV}={raw} is not 1, 2 or 3"))
                })
            })
            .transpose()?;

        let settings = SyncSettings {
            branch: self.branch.clone(),
            product: self.product.clone(),
            arch: self.arch.clone(),
            developer_mode: self.developer_mode,
            gpg: self.gpg,
            timeouts: Timeouts {
                control: Duration::from_secs(self.timeouts.control_secs),
                transfer: Duration::from_secs(self.timeouts.transfer_secs),
            },
            ..SyncSettings::default()
        };
        Ok(settings.with_forced_tier(forced_tier))
    }

    /// Enabled repositories, optionally narrowed to `only`, in file order.
    pub fn repositories(&self, only: &[String]) -> Result<Vec<RepositoryDescriptor>, ConfigError> {
        if let Some(unknown) = only
            .iter()
            .find(|id| !self.repositories.iter().any(|r| &r.id == *id))
        {
            return Err(ConfigError::Invalid(format!("unknown repository `{unknown}`")));
        }

        Ok(self
            .repositories
            .iter()
            .filter(|r| r.enabled && (only.is_empty() || only.contains(&r.id)))
            .map(|entry| self.descriptor(entry))
            .collect())
    }

    fn descriptor(&self, entry: &RepositoryEntry) -> RepositoryDescriptor {
        let id = RepositoryId::new(&entry.id);
        let local_path = entry.local_path.clone().unwrap_or_else(|| {
            RepositoryDescriptor::default_local_path(
                &self.database_root,
                &id,
                &self.product,
                &self.arch,
                &self.branch,
            )
        });
        let package_mirrors = if entry.package_mirrors.is_empty() {
            entry.metadata_mirrors.clone()
        } else {
            entry.package_mirrors.clone()
        };
        RepositoryDescriptor {
            id,
            description: entry.description.clone(),
            metadata_mirrors: entry.metadata_mirrors.clone(),
            package_mirrors,
            local_path,
            branch: self.branch.clone(),
            product: self.product.clone(),
            arch: self.arch.clone(),
            compression: entry.compression,
            service: entry.service.as_ref().map(|s| ServiceEndpoint {
                host: s.host.clone(),
                port: s.port,
            }),
            require_signature: entry.require_signature,
        }
    }

    pub fn scores_path(&self) -> PathBuf {
        self.cache_dir.join("mirror_scores.json")
    }

    pub fn repository_cache(&self) -> PathBuf {
        self.cache_dir.join("repositories")
    }
}
