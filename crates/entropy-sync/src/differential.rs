use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;

use crate::error::SyncError;
use crate::fetch::AbortSignal;
use crate::repository::RepositoryDescriptor;
use crate::service::{
    DiffReply, PackageDiff, RecordsReply, RepositoryMetadata, RepositoryQuery, ServiceConnection,
    ServiceConnector, ServiceError, SessionToken,
};
use crate::settings::SyncSettings;
use crate::store::{
    ChecksumOptions, LIBRARY_INDEX_KEY, MetadataStore, PackageId, PackageRecord, StoreError,
    StoreOpener,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffSummary {
    pub added: usize,
    pub removed: usize,
    /// Local checksum after commit equals the server's.
    pub checksum_matched: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DifferentialResult {
    Success(DiffSummary),
    /// Differential sync does not apply this time; fall back to a bulk tier.
    Unavailable(String),
    RemoteLocked,
    Failed(String),
    Aborted,
}

/// Everything fetched from the service before the local store is touched.
struct Exchange {
    diff: PackageDiff,
    scratch: ScratchCache,
    metadata: RepositoryMetadata,
}

/// Fetched package records, one JSON file per package.
struct ScratchCache {
    dir: tempfile::TempDir,
}

impl ScratchCache {
    fn new() -> Result<Self, SyncError> {
        let dir = tempfile::Builder::new()
            .prefix("entropy-diff-")
            .tempdir()
            .map_err(|e| SyncError::local(std::env::temp_dir(), e))?;
        Ok(Self { dir })
    }

    fn path(&self, id: PackageId) -> PathBuf {
        self.dir.path().join(format!("{id}.json"))
    }

    fn store(&self, record: &PackageRecord) -> Result<(), SyncError> {
        let path = self.path(record.id);
        let json = serde_json::to_vec(record)
            .map_err(|e| SyncError::local(&path, std::io::Error::other(e)))?;
        std::fs::write(&path, json).map_err(|e| SyncError::local(&path, e))
    }

    fn load(&self, id: PackageId) -> Result<PackageRecord, SyncError> {
        let path = self.path(id);
        let raw = std::fs::read(&path).map_err(|e| SyncError::local(&path, e))?;
        serde_json::from_slice(&raw)
            .map_err(|e| SyncError::Integrity(format!("scratch record {id}: {e}")))
    }
}

/// Tier-3 engine: fetch only what changed over a server session and apply it
/// in one local transaction.
pub struct DifferentialSyncEngine<'a> {
    settings: &'a SyncSettings,
    connector: &'a dyn ServiceConnector,
    opener: &'a dyn StoreOpener,
}

impl<'a> DifferentialSyncEngine<'a> {
    pub fn new(
        settings: &'a SyncSettings,
        connector: &'a dyn ServiceConnector,
        opener: &'a dyn StoreOpener,
    ) -> Self {
        Self {
            settings,
            connector,
            opener,
        }
    }

    pub async fn sync(&self, repo: &RepositoryDescriptor, abort: &AbortSignal) -> DifferentialResult {
        let Some(endpoint) = repo.service.as_ref() else {
            return DifferentialResult::Unavailable("no differential service configured".into());
        };
        // Opening a missing database would create an empty one.
        if !repo.database_path().is_file() {
            return DifferentialResult::Unavailable("no local database to compare against".into());
        }
        let timeout = self.settings.timeouts.control;

        let mut conn = match self.call(self.connector.connect(endpoint, timeout)).await {
            Ok(conn) => conn,
            Err(e) => return DifferentialResult::Unavailable(e.to_string()),
        };
        let session = match self.call(conn.open_session()).await {
            Ok(session) => session,
            Err(e) => {
                conn.disconnect().await;
                return DifferentialResult::Unavailable(e.to_string());
            }
        };

        let exchange = match self.local_identifiers(repo) {
            Ok(local_ids) => {
                self.exchange(conn.as_mut(), &session, repo, &local_ids, abort)
                    .await
            }
            Err(e) => Err(DifferentialResult::Failed(format!("cannot read local store: {e}"))),
        };

        // The session is released on every path before local changes begin.
        if let Err(e) = self.call(conn.close_session(&session)).await {
            tracing::debug!(repository = %repo.id, "closing session failed: {e}");
        }
        conn.disconnect().await;

        let exchange = match exchange {
            Ok(exchange) => exchange,
            Err(result) => return result,
        };
        if abort.is_raised() {
            return DifferentialResult::Aborted;
        }

        match self.apply(repo, &exchange) {
            Ok(summary) => DifferentialResult::Success(summary),
            Err(e) => DifferentialResult::Failed(format!("local update rolled back: {e}")),
        }
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, ServiceError> {
        tokio::time::timeout(self.settings.timeouts.control, fut)
            .await
            .map_err(|_| ServiceError::Timeout)?
    }

    fn local_identifiers(&self, repo: &RepositoryDescriptor) -> Result<BTreeSet<PackageId>, StoreError> {
        let store = self.opener.open(&repo.database_path())?;
        let ids = store.list_all_identifiers();
        store.close()?;
        ids
    }

    async fn exchange(
        &self,
        conn: &mut dyn ServiceConnection,
        session: &SessionToken,
        repo: &RepositoryDescriptor,
        local_ids: &BTreeSet<PackageId>,
        abort: &AbortSignal,
    ) -> Result<Exchange, DifferentialResult> {
        let query = RepositoryQuery {
            repository: repo.id.clone(),
            arch: repo.arch.clone(),
            product: repo.product.clone(),
            branch: repo.branch.clone(),
        };

        let reply = self
            .call(conn.differential_comparison(session, &query, local_ids))
            .await
            .map_err(|e| DifferentialResult::Unavailable(e.to_string()))?;
        let diff = match DiffReply::classify(reply) {
            DiffReply::Diff(diff) => diff,
            DiffReply::Locked => return Err(DifferentialResult::RemoteLocked),
            DiffReply::Malformed(e) => return Err(DifferentialResult::Failed(e)),
        };
        tracing::info!(
            repository = %repo.id,
            added = diff.added.len(),
            removed = diff.removed.len(),
            "differential comparison"
        );

        if diff.is_empty() && self.settings.force {
            return Err(DifferentialResult::Unavailable(
                "forced sync with no remote changes".into(),
            ));
        }
        let limits = self.settings.limits;
        if diff.added.len() > limits.differential_threshold {
            return Err(DifferentialResult::Unavailable(format!(
                "{} packages added, above the differential limit of {}",
                diff.added.len(),
                limits.differential_threshold
            )));
        }

        let scratch = ScratchCache::new().map_err(|e| DifferentialResult::Failed(e.to_string()))?;
        for batch in diff.added.chunks(limits.batch_size.max(1)) {
            self.fetch_batch(conn, session, &query, batch, &scratch, abort)
                .await?;
        }

        let reply = self
            .call(conn.repository_metadata(session, &query))
            .await
            .map_err(|e| DifferentialResult::Failed(format!("metadata request failed: {e}")))?;
        let metadata = RepositoryMetadata::from_reply(reply)
            .map_err(|e| DifferentialResult::Failed(format!("bad repository metadata: {e}")))?;

        Ok(Exchange {
            diff,
            scratch,
            metadata,
        })
    }

    async fn fetch_batch(
        &self,
        conn: &mut dyn ServiceConnection,
        session: &SessionToken,
        query: &RepositoryQuery,
        batch: &[PackageId],
        scratch: &ScratchCache,
        abort: &AbortSignal,
    ) -> Result<(), DifferentialResult> {
        let attempts = self.settings.limits.batch_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            if abort.is_raised() {
                return Err(DifferentialResult::Aborted);
            }
            let reply = match self.call(conn.package_records(session, query, batch)).await {
                Ok(reply) => reply,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };
            match RecordsReply::classify(reply) {
                RecordsReply::Records(records) => {
                    let got: BTreeSet<PackageId> = records.iter().map(|r| r.id).collect();
                    if let Some(missing) = batch.iter().find(|&&id| !got.contains(&id)) {
                        last_error = format!("package {missing} missing from reply");
                        continue;
                    }
                    for record in records.iter().filter(|r| batch.contains(&r.id)) {
                        scratch
                            .store(record)
                            .map_err(|e| DifferentialResult::Failed(e.to_string()))?;
                    }
                    return Ok(());
                }
                RecordsReply::Locked => return Err(DifferentialResult::RemoteLocked),
                RecordsReply::Retry => last_error = "server asked to retry".into(),
                RecordsReply::Error { code, message } => {
                    last_error = format!("server error {code}: {message}")
                }
                RecordsReply::Malformed(e) => last_error = e,
            }
            tracing::debug!(attempt, "package batch failed: {last_error}");
        }
        Err(DifferentialResult::Failed(format!(
            "package batch failed after {attempts} attempts: {last_error}"
        )))
    }

    /// Steps after the session is gone: one transaction, then checksum.
    fn apply(&self, repo: &RepositoryDescriptor, exchange: &Exchange) -> Result<DiffSummary, SyncError> {
        let mut store = self.opener.open(&repo.database_path())?;
        store.begin()?;
        if let Err(e) = Self::mutate(store.as_mut(), exchange) {
            let _ = store.rollback();
            let _ = store.close();
            return Err(e);
        }
        if let Err(e) = store.commit() {
            let _ = store.rollback();
            let _ = store.close();
            return Err(e.into());
        }

        let local = store.checksum(ChecksumOptions::default());
        store.close()?;
        let checksum_matched = local? == exchange.diff.secure_checksum;
        if !checksum_matched {
            tracing::warn!(
                repository = %repo.id,
                "local checksum differs from the server's after update; the next sync will reconcile"
            );
        }

        Ok(DiffSummary {
            added: exchange.diff.added.len(),
            removed: exchange.diff.removed.len(),
            checksum_matched,
        })
    }

    fn mutate(store: &mut dyn MetadataStore, exchange: &Exchange) -> Result<(), SyncError> {
        let meta = &exchange.metadata;
        store.set_tree_updates(&meta.tree_updates)?;
        store.replace_package_sets(&meta.sets)?;
        let library = serde_json::to_string(&meta.library_ids)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        store.set_setting(LIBRARY_INDEX_KEY, &library)?;

        for id in &exchange.diff.added {
            let record = exchange.scratch.load(*id)?;
            store.insert_record(&record)?;
        }
        for id in &exchange.diff.removed {
            match store.remove_record(*id) {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
