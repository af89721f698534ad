use crate::repository::{RepositoryDescriptor, ServiceEndpoint};
use crate::service::{ServiceConnector, ServiceError};
use crate::settings::SyncSettings;
use crate::store::StoreOpener;
use crate::tier::ProtocolTier;

/// Decides which protocol tier a repository starts at.
pub struct ProtocolNegotiator<'a> {
    settings: &'a SyncSettings,
    connector: Option<&'a dyn ServiceConnector>,
    opener: &'a dyn StoreOpener,
}

impl<'a> ProtocolNegotiator<'a> {
    pub fn new(
        settings: &'a SyncSettings,
        connector: Option<&'a dyn ServiceConnector>,
        opener: &'a dyn StoreOpener,
    ) -> Self {
        Self {
            settings,
            connector,
            opener,
        }
    }

    /// Tier chosen from configuration alone, without touching the network.
    pub fn preliminary_tier(&self, repo: &RepositoryDescriptor) -> ProtocolTier {
        if let Some(forced) = self.settings.forced_tier {
            return forced;
        }
        if self.settings.developer_mode || self.settings.live_media {
            return ProtocolTier::LightDatabase;
        }
        if repo.service.is_none() || self.connector.is_none() {
            return ProtocolTier::LightDatabase;
        }
        if !self.opener.supports_dump_import() {
            return ProtocolTier::LightDatabase;
        }
        ProtocolTier::Differential
    }

    /// Starting tier for this pass.
    ///
    /// Tier 3 must pass a connectivity probe, otherwise tier 1 is used. With
    /// no local database to diff against, tier 3 becomes tier 2.
    pub async fn select_tier(&self, repo: &RepositoryDescriptor) -> ProtocolTier {
        let tier = self.preliminary_tier(repo);
        if tier != ProtocolTier::Differential {
            return tier;
        }
        if self.settings.forced_tier.is_some() {
            if !repo.database_path().is_file() {
                tracing::debug!(repository = %repo.id, "no local database, forced tier 3 uses dump");
                return ProtocolTier::CompressedDump;
            }
            return tier;
        }

        let (Some(connector), Some(endpoint)) = (self.connector, repo.service.as_ref()) else {
            return ProtocolTier::LightDatabase;
        };
        if let Err(e) = self.probe(connector, endpoint).await {
            tracing::info!(repository = %repo.id, %endpoint, "differential service unreachable: {e}");
            return ProtocolTier::LightDatabase;
        }

        if !repo.database_path().is_file() {
            tracing::debug!(repository = %repo.id, "no local database, using dump");
            return ProtocolTier::CompressedDump;
        }
        ProtocolTier::Differential
    }

    /// Connect, open a session and close it again.
    async fn probe(
        &self,
        connector: &dyn ServiceConnector,
        endpoint: &ServiceEndpoint,
    ) -> Result<(), ServiceError> {
        let timeout = self.settings.timeouts.control;
        let attempt = async {
            let mut conn = connector.connect(endpoint, timeout).await?;
            let result = match conn.open_session().await {
                Ok(session) => conn.close_session(&session).await,
                Err(e) => Err(e),
            };
            conn.disconnect().await;
            result
        };
        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| ServiceError::Timeout)?
    }
}

/// Whether the system booted from live media.
pub fn detect_live_media() -> bool {
    std::fs::read_to_string("/proc/cmdline")
        .map(|cmdline| cmdline.split_whitespace().any(|arg| arg == "cdroot"))
        .unwrap_or(false)
}
