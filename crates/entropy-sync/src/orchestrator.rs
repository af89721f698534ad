use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::Instrument;

use crate::bulk::{BulkResult, BulkSyncEngine};
use crate::context::SyncContext;
use crate::differential::{DifferentialResult, DifferentialSyncEngine};
use crate::error::SyncError;
use crate::feedback::Feedback;
use crate::fetch::{AbortSignal, Fetcher};
use crate::hooks::{CacheInvalidator, SelfUpdateProbe, run_post_update_script};
use crate::lock::{LockError, ProcessLock};
use crate::mirror::MirrorScores;
use crate::negotiator::ProtocolNegotiator;
use crate::payload::PayloadKind;
use crate::repository::{RepositoryDescriptor, RepositoryId, parse_revision};
use crate::service::ServiceConnector;
use crate::settings::SyncSettings;
use crate::signature::SignatureVerifier;
use crate::store::StoreOpener;
use crate::tier::{ProtocolTier, TierLadder};

pub const EXIT_OK: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_ALL_UNAVAILABLE: i32 = 2;
/// Another sync holds the process-wide lock.
pub const EXIT_BUSY: i32 = 4;
pub const EXIT_HARD_FAILURE: i32 = 128;

/// How often an interrupt is noticed while waiting out a remote lock.
const ABORT_POLL: Duration = Duration::from_millis(100);

enum LockRecheck {
    Locked,
    Released,
    Interrupted,
}

/// Terminal state of one repository's pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryOutcome {
    AlreadyUpToDate,
    Updated {
        tier: ProtocolTier,
        /// False only when a differential update ended with a checksum warning.
        checksum_matched: bool,
    },
    Unavailable(String),
    RemoteLocked,
    Failed(String),
    Aborted,
}

impl RepositoryOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AlreadyUpToDate => "already up to date",
            Self::Updated { .. } => "updated",
            Self::Unavailable(_) => "unavailable",
            Self::RemoteLocked => "locked",
            Self::Failed(_) => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Unavailable(reason) | Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// What the user should do about it.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Failed(_) => Some("check the logs for details"),
            Self::Unavailable(_) | Self::RemoteLocked | Self::Aborted => {
                Some("will retry on the next sync")
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RepositoryReport {
    pub id: RepositoryId,
    pub outcome: RepositoryOutcome,
    pub tiers: Vec<ProtocolTier>,
    pub revision: Option<u64>,
    pub feedback: Vec<Feedback>,
}

/// Aggregate result of one sync invocation.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub already_up_to_date: usize,
    pub unavailable: usize,
    pub updated: usize,
    pub failed: usize,
    pub hard_error: bool,
    pub interrupted: bool,
    pub reports: Vec<RepositoryReport>,
    pub self_update: Option<String>,
}

impl SyncOutcome {
    fn record(&mut self, report: RepositoryReport) {
        match &report.outcome {
            RepositoryOutcome::AlreadyUpToDate => self.already_up_to_date += 1,
            RepositoryOutcome::Updated { .. } => self.updated += 1,
            RepositoryOutcome::Unavailable(_) | RepositoryOutcome::RemoteLocked => {
                self.unavailable += 1
            }
            RepositoryOutcome::Aborted => {
                self.unavailable += 1;
                self.interrupted = true;
            }
            RepositoryOutcome::Failed(_) => {
                self.failed += 1;
                self.hard_error = true;
            }
        }
        self.reports.push(report);
    }

    /// Hard failures win, then total unavailability, then partial.
    pub fn exit_code(&self) -> i32 {
        if self.hard_error {
            EXIT_HARD_FAILURE
        } else if self.unavailable > 0 && self.unavailable == self.reports.len() {
            EXIT_ALL_UNAVAILABLE
        } else if self.unavailable > 0 {
            EXIT_PARTIAL
        } else {
            EXIT_OK
        }
    }
}

/// Sequences every configured repository through
/// check-up-to-date, check-lock, negotiate, download/apply and post hooks.
pub struct SyncOrchestrator {
    settings: SyncSettings,
    repositories: Vec<RepositoryDescriptor>,
    fetcher: Arc<dyn Fetcher>,
    opener: Arc<dyn StoreOpener>,
    connector: Option<Arc<dyn ServiceConnector>>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    cache: Option<Arc<dyn CacheInvalidator>>,
    self_update: Option<Arc<dyn SelfUpdateProbe>>,
    scores: Arc<MirrorScores>,
    lock_path: PathBuf,
}

impl SyncOrchestrator {
    pub fn new(
        settings: SyncSettings,
        repositories: Vec<RepositoryDescriptor>,
        fetcher: Arc<dyn Fetcher>,
        opener: Arc<dyn StoreOpener>,
        lock_path: impl Into<PathBuf>,
    ) -> Self {
        let scores = Arc::new(MirrorScores::new(settings.limits.failure_threshold));
        Self {
            settings,
            repositories,
            fetcher,
            opener,
            connector: None,
            verifier: None,
            cache: None,
            self_update: None,
            scores,
            lock_path: lock_path.into(),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn ServiceConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheInvalidator>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_self_update(mut self, probe: Arc<dyn SelfUpdateProbe>) -> Self {
        self.self_update = Some(probe);
        self
    }

    /// Share a score table, e.g. one loaded from disk.
    pub fn with_scores(mut self, scores: Arc<MirrorScores>) -> Self {
        self.scores = scores;
        self
    }

    pub fn scores(&self) -> &Arc<MirrorScores> {
        &self.scores
    }

    /// Sync every repository in configured order.
    ///
    /// Fails with `SyncError::Busy` before touching anything when another
    /// invocation holds the lock.
    pub async fn run(&self, abort: &AbortSignal) -> Result<SyncOutcome, SyncError> {
        let _lock = ProcessLock::acquire(&self.lock_path).map_err(|e| match e {
            LockError::Busy(path) => SyncError::Busy(path),
            LockError::Io { path, source } => SyncError::local(path, source),
        })?;

        let mut outcome = SyncOutcome::default();
        for repo in &self.repositories {
            let report = if abort.is_interrupted() {
                RepositoryReport {
                    id: repo.id.clone(),
                    outcome: RepositoryOutcome::Aborted,
                    tiers: Vec::new(),
                    revision: repo.local_revision(),
                    feedback: Vec::new(),
                }
            } else {
                let span = tracing::info_span!("sync", repository = %repo.id);
                self.sync_repository(repo, abort).instrument(span).await
            };
            tracing::info!(repository = %report.id, outcome = report.outcome.label(), "repository done");
            outcome.record(report);
        }

        if outcome.updated > 0 {
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.clear_all() {
                    tracing::warn!("cache clear failed: {e}");
                }
            }
            if let Some(probe) = &self.self_update {
                let updated: Vec<&RepositoryDescriptor> = self
                    .repositories
                    .iter()
                    .filter(|repo| {
                        outcome.reports.iter().any(|r| {
                            r.id == repo.id && matches!(r.outcome, RepositoryOutcome::Updated { .. })
                        })
                    })
                    .collect();
                outcome.self_update = probe.check(&updated).await;
            }
        }

        Ok(outcome)
    }

    async fn sync_repository(&self, repo: &RepositoryDescriptor, abort: &AbortSignal) -> RepositoryReport {
        let negotiator = ProtocolNegotiator::new(
            &self.settings,
            self.connector.as_deref(),
            self.opener.as_ref(),
        );
        let mut ctx = SyncContext::new(repo.clone(), negotiator.preliminary_tier(repo));
        self.scores.begin_pass(&repo.metadata_mirrors);

        let outcome = match self.check_remote(&mut ctx).await {
            Some(early) => early,
            None => match std::fs::create_dir_all(&repo.local_path) {
                Err(e) => {
                    let err = SyncError::local(&repo.local_path, e);
                    ctx.error(err.to_string());
                    RepositoryOutcome::Failed(err.to_string())
                }
                Ok(()) => {
                    let tier = negotiator.select_tier(repo).await;
                    tracing::debug!(%tier, "negotiated");
                    ctx.tiers = TierLadder::new(tier);
                    self.transfer(&mut ctx, abort).await
                }
            },
        };

        if let RepositoryOutcome::Updated { .. } = outcome {
            self.post_hooks(&mut ctx).await;
        }

        RepositoryReport {
            id: repo.id.clone(),
            revision: repo.local_revision(),
            tiers: ctx.tiers.attempted().to_vec(),
            feedback: std::mem::take(&mut ctx.feedback),
            outcome,
        }
    }

    /// CheckUpToDate and CheckLock. `Some` ends the pass early.
    async fn check_remote(&self, ctx: &mut SyncContext) -> Option<RepositoryOutcome> {
        let repo = &ctx.repo;
        let Some(mirror) = self.scores.first_eligible(&repo.metadata_mirrors) else {
            return Some(RepositoryOutcome::Unavailable("all mirrors exhausted".into()));
        };
        let mirror = mirror.to_string();

        let remote = self
            .fetcher
            .fetch_text(&repo.remote_url(&mirror, PayloadKind::Revision))
            .await
            .and_then(|raw| parse_revision(&raw));
        ctx.remote_revision = remote;

        let local = repo.local_revision();
        let current = remote.is_some() && remote == local && repo.database_path().is_file();
        if current && !self.settings.force {
            ctx.info(format!("already at revision {}", local.unwrap_or_default()));
            return Some(RepositoryOutcome::AlreadyUpToDate);
        }

        if ctx.tiers.current() == ProtocolTier::Differential
            && self.marker_present(repo, &mirror, PayloadKind::ServiceLock).await
        {
            ctx.info("differential service is being rebuilt, it will be ready soon");
            return Some(RepositoryOutcome::RemoteLocked);
        }

        if self.marker_present(repo, &mirror, PayloadKind::DownloadLock).await {
            ctx.info("repository is being updated on the mirror");
            return Some(RepositoryOutcome::RemoteLocked);
        }
        None
    }

    async fn marker_present(&self, repo: &RepositoryDescriptor, mirror: &str, kind: PayloadKind) -> bool {
        self.fetcher
            .fetch_text(&repo.remote_url(mirror, kind))
            .await
            .is_some()
    }

    /// Download/Apply with tier downgrades.
    async fn transfer(&self, ctx: &mut SyncContext, abort: &AbortSignal) -> RepositoryOutcome {
        loop {
            if abort.is_interrupted() {
                return RepositoryOutcome::Aborted;
            }
            let tier = ctx.tiers.attempt();
            match tier {
                ProtocolTier::Differential => {
                    let Some(connector) = self.connector.as_deref() else {
                        ctx.tiers.downgrade(ProtocolTier::LightDatabase);
                        continue;
                    };
                    let engine =
                        DifferentialSyncEngine::new(&self.settings, connector, self.opener.as_ref());
                    match engine.sync(&ctx.repo, abort).await {
                        DifferentialResult::Success(summary) => {
                            if !summary.checksum_matched {
                                ctx.warn("repository checksum does not match after update");
                            }
                            ctx.info(format!(
                                "{} packages added, {} removed",
                                summary.added, summary.removed
                            ));
                            return RepositoryOutcome::Updated {
                                tier,
                                checksum_matched: summary.checksum_matched,
                            };
                        }
                        DifferentialResult::Aborted => return RepositoryOutcome::Aborted,
                        DifferentialResult::RemoteLocked => match self.recheck_lock(ctx, abort).await {
                            LockRecheck::Locked => return RepositoryOutcome::RemoteLocked,
                            LockRecheck::Interrupted => return RepositoryOutcome::Aborted,
                            LockRecheck::Released => {}
                        },
                        DifferentialResult::Unavailable(reason) => {
                            tracing::info!("differential sync not applicable: {reason}");
                        }
                        DifferentialResult::Failed(reason) => {
                            ctx.warn(format!("differential sync failed: {reason}"));
                        }
                    }
                    ctx.tiers.downgrade(ProtocolTier::LightDatabase);
                }
                bulk => {
                    let engine = BulkSyncEngine::new(
                        &self.settings,
                        Arc::clone(&self.fetcher),
                        &self.scores,
                        self.opener.as_ref(),
                        self.verifier.as_deref(),
                    );
                    return match engine.sync(ctx, bulk, abort).await {
                        BulkResult::Installed { .. } => RepositoryOutcome::Updated {
                            tier: bulk,
                            checksum_matched: true,
                        },
                        BulkResult::Unavailable(reason) => RepositoryOutcome::Unavailable(reason),
                        BulkResult::RemoteLocked => RepositoryOutcome::RemoteLocked,
                        BulkResult::Failed(reason) => RepositoryOutcome::Failed(reason),
                        BulkResult::Aborted => RepositoryOutcome::Aborted,
                    };
                }
            }
        }
    }

    /// After a mid-session lock, wait and look at the download lock again.
    async fn recheck_lock(&self, ctx: &mut SyncContext, abort: &AbortSignal) -> LockRecheck {
        let deadline = Instant::now() + self.settings.locked_retry_delay;
        loop {
            if abort.is_interrupted() {
                return LockRecheck::Interrupted;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep_until(deadline.min(now + ABORT_POLL)).await;
        }

        let repo = &ctx.repo;
        let Some(mirror) = self.scores.first_eligible(&repo.metadata_mirrors) else {
            return LockRecheck::Locked;
        };
        let mirror = mirror.to_string();
        if self.marker_present(repo, &mirror, PayloadKind::DownloadLock).await {
            ctx.info("repository locked while syncing");
            LockRecheck::Locked
        } else {
            LockRecheck::Released
        }
    }

    /// Best-effort steps after a successful apply.
    async fn post_hooks(&self, ctx: &mut SyncContext) {
        match ctx.remote_revision {
            Some(revision) => {
                if let Err(e) = ctx.repo.write_revision(revision) {
                    ctx.warn(format!("cannot record revision: {e}"));
                }
            }
            None => ctx.warn("remote revision unknown, not recorded"),
        }

        let reindexed = self.opener.open(&ctx.repo.database_path()).and_then(|mut store| {
            let result = store.rebuild_indexes();
            store.close()?;
            result
        });
        if let Err(e) = reindexed {
            ctx.warn(format!("index rebuild failed: {e}"));
        }

        match run_post_update_script(&ctx.repo, &self.settings.system_root).await {
            Ok(Some(0)) | Ok(None) => {}
            Ok(Some(code)) => ctx.warn(format!("post-update hook exited with {code}")),
            Err(e) => ctx.warn(format!("post-update hook failed: {e}")),
        }

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.invalidate_repository(&ctx.repo.id) {
                ctx.warn(format!("cache invalidation failed: {e}"));
            }
        }
    }
}
