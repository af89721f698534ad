use std::sync::Arc;

use anyhow::{Context, Result};
use entropy_sync::negotiator::detect_live_media;
use entropy_sync::{
    AbortSignal, DirectoryCache, EXIT_BUSY, EXIT_OK, MirrorScores, RepositoryOutcome,
    StoreOpener, StoreSelfUpdateProbe, SyncError, SyncOrchestrator, SyncOutcome,
};
use entropy_sync_http::{HttpFetcher, HttpServiceConnector};
use entropy_sync_store::RepositoryStoreOpener;

use crate::commands::print_feedback;
use crate::config::AppConfig;
use crate::gnupg::GnupgVerifier;

/// Package atom of this client, looked up after updates.
const SELF_PACKAGE: &str = "sys-apps/entropy";

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub force: bool,
    pub developer: bool,
    /// Only these repository ids; all enabled ones when empty.
    pub repositories: Vec<String>,
    /// Raw `FORCE_EAPI` value.
    pub forced_tier: Option<String>,
}

/// Sync every selected repository and return the process exit code.
pub async fn run(config: &AppConfig, options: &SyncOptions, abort: &AbortSignal) -> Result<i32> {
    let mut settings = config.settings(options.forced_tier.as_deref())?;
    settings.force = options.force;
    if options.developer && settings.forced_tier.is_none() {
        settings.developer_mode = true;
    }
    settings.live_media = detect_live_media();

    let repositories = config.repositories(&options.repositories)?;
    if repositories.is_empty() {
        println!("No repositories configured.");
        return Ok(EXIT_OK);
    }

    let scores_path = config.scores_path();
    let scores = Arc::new(MirrorScores::load(
        &scores_path,
        settings.limits.failure_threshold,
    )?);
    let fetcher = HttpFetcher::new(settings.timeouts).context("cannot set up HTTP transport")?;
    let connector =
        HttpServiceConnector::new().context("cannot set up differential service client")?;
    let opener: Arc<dyn StoreOpener> = Arc::new(RepositoryStoreOpener);

    let mut orchestrator = SyncOrchestrator::new(
        settings.clone(),
        repositories,
        Arc::new(fetcher),
        Arc::clone(&opener),
        &config.lock_file,
    )
    .with_connector(Arc::new(connector))
    .with_cache(Arc::new(DirectoryCache::new(config.repository_cache())))
    .with_self_update(Arc::new(StoreSelfUpdateProbe::new(
        Arc::clone(&opener),
        SELF_PACKAGE,
        env!("CARGO_PKG_VERSION"),
    )))
    .with_scores(Arc::clone(&scores));
    if settings.gpg {
        orchestrator = orchestrator.with_verifier(Arc::new(GnupgVerifier::new(&config.gpg_home)));
    }

    let outcome = match orchestrator.run(abort).await {
        Ok(outcome) => outcome,
        Err(SyncError::Busy(path)) => {
            eprintln!("another sync is running (lock held at {})", path.display());
            return Ok(EXIT_BUSY);
        }
        Err(e) => return Err(e).context("sync could not start"),
    };

    if let Err(e) = scores.save(&scores_path) {
        tracing::warn!("cannot save mirror scores: {e}");
    }
    print_outcome(&outcome);
    Ok(outcome.exit_code())
}

fn print_outcome(outcome: &SyncOutcome) {
    for report in &outcome.reports {
        let revision = report
            .revision
            .map(|r| format!(" (revision {r})"))
            .unwrap_or_default();
        match &report.outcome {
            RepositoryOutcome::Updated { tier, .. } => {
                println!("{}: updated via {tier}{revision}", report.id);
            }
            other => match other.reason() {
                Some(reason) => println!("{}: {}: {reason}", report.id, other.label()),
                None => println!("{}: {}{revision}", report.id, other.label()),
            },
        }
        print_feedback(&report.feedback);
        if let Some(hint) = report.outcome.hint() {
            eprintln!("  {hint}");
        }
    }

    println!(
        "{} updated, {} up to date, {} unavailable, {} failed",
        outcome.updated, outcome.already_up_to_date, outcome.unavailable, outcome.failed
    );
    if outcome.interrupted {
        eprintln!("Interrupted.");
    }
    if let Some(notice) = &outcome.self_update {
        println!("{notice}");
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use entropy_sync::lock::ProcessLock;
    use entropy_sync::store::MetadataStore;
    use entropy_sync::test_support::{bzip2_bytes, md5_hex, sample_records};
    use entropy_sync::{CompressionFormat, EXIT_ALL_UNAVAILABLE};
    use entropy_sync_store::RepositoryStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::RepositoryEntry;

    const BASE: &str = "/standard/main/database/amd64/4";

    fn config(root: &Path, mirror: String) -> AppConfig {
        AppConfig {
            arch: "amd64".into(),
            gpg: false,
            database_root: root.join("db"),
            cache_dir: root.join("cache"),
            lock_file: root.join("sync.lock"),
            gpg_home: root.join("gpg"),
            repositories: vec![RepositoryEntry {
                id: "main".into(),
                description: String::new(),
                metadata_mirrors: vec![mirror],
                package_mirrors: vec![],
                compression: CompressionFormat::Bzip2,
                service: None,
                require_signature: false,
                enabled: true,
                local_path: None,
            }],
            ..AppConfig::default()
        }
    }

    fn light_database(dir: &Path, count: i64) -> Vec<u8> {
        let path = dir.join("remote.db");
        let mut store = RepositoryStore::open(&path).unwrap();
        for record in sample_records(count) {
            store.insert_record(&record).unwrap();
        }
        Box::new(store).close().unwrap();
        bzip2_bytes(&std::fs::read(&path).unwrap())
    }

    async fn serve(server: &MockServer, name: &str, body: Vec<u8>) {
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn syncs_light_database_then_reports_up_to_date() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        let payload = light_database(dir.path(), 3);
        serve(&server, "packages.db.revision", b"3\n".to_vec()).await;
        serve(
            &server,
            "packages.db.light.bz2.md5",
            format!("{}  packages.db.light.bz2\n", md5_hex(&payload)).into_bytes(),
        )
        .await;
        serve(&server, "packages.db.light.bz2", payload).await;
        let config = config(dir.path(), server.uri());

        let code = run(&config, &SyncOptions::default(), &AbortSignal::new())
            .await
            .unwrap();
        assert_eq!(code, EXIT_OK);

        let repo = &config.repositories(&[]).unwrap()[0];
        assert_eq!(repo.local_revision(), Some(3));
        let store = RepositoryStore::open(&repo.database_path()).unwrap();
        assert_eq!(store.package_count().unwrap(), 3);
        assert!(config.scores_path().exists());

        let code = run(&config, &SyncOptions::default(), &AbortSignal::new())
            .await
            .unwrap();
        assert_eq!(code, EXIT_OK);
        let payload_fetches = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path().ends_with("packages.db.light.bz2"))
            .count();
        assert_eq!(payload_fetches, 1);
    }

    #[tokio::test]
    async fn empty_mirror_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        let config = config(dir.path(), server.uri());

        let code = run(&config, &SyncOptions::default(), &AbortSignal::new())
            .await
            .unwrap();

        assert_eq!(code, EXIT_ALL_UNAVAILABLE);
    }

    #[tokio::test]
    async fn held_lock_exits_busy() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        let config = config(dir.path(), server.uri());
        let _held = ProcessLock::acquire(&config.lock_file).unwrap();

        let code = run(&config, &SyncOptions::default(), &AbortSignal::new())
            .await
            .unwrap();

        assert_eq!(code, EXIT_BUSY);
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
