use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::checksum::verify_against_manifest;
use crate::compression::{decompress, unpack_bundle};
use crate::context::SyncContext;
use crate::download::{DownloadError, DownloadedArtifact, Downloader};
use crate::fetch::{AbortSignal, Fetcher};
use crate::lock::LockWatch;
use crate::mirror::{FailureSeverity, MirrorScores};
use crate::payload::{
    DATABASE_FILE, DUMP_FILE, META_NOT_FOUND_FILE, PUBLIC_KEY_FILE, PayloadKind, REVISION_FILE,
    signature_name,
};
use crate::settings::SyncSettings;
use crate::signature::{SignatureReport, SignatureVerifier, ensure_repository_key, verify_downloads};
use crate::store::{StoreOpener, align_annotations};
use crate::tier::ProtocolTier;

const TEMP_DATABASE: &str = "packages.db.tmp";
const BUNDLE_DIR: &str = "bundle";

/// Outcome of a full-file sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkResult {
    Installed {
        tier: ProtocolTier,
        mirror: String,
        signatures: Option<SignatureReport>,
    },
    /// No mirror had the payload.
    Unavailable(String),
    /// The download lock appeared while transferring.
    RemoteLocked,
    Failed(String),
    Aborted,
}

/// Downloads, verifies and atomically installs a complete database (tier 1)
/// or dump (tier 2).
pub struct BulkSyncEngine<'a> {
    settings: &'a SyncSettings,
    fetcher: Arc<dyn Fetcher>,
    scores: &'a MirrorScores,
    opener: &'a dyn StoreOpener,
    verifier: Option<&'a dyn SignatureVerifier>,
}

/// Files fetched next to the payload and staged until the database is in place.
struct Staging {
    dir: tempfile::TempDir,
    /// The downloaded bundle itself, verified but never installed.
    archive: Option<PathBuf>,
    bundle: Vec<PathBuf>,
    notice: Option<PathBuf>,
}

impl<'a> BulkSyncEngine<'a> {
    pub fn new(
        settings: &'a SyncSettings,
        fetcher: Arc<dyn Fetcher>,
        scores: &'a MirrorScores,
        opener: &'a dyn StoreOpener,
        verifier: Option<&'a dyn SignatureVerifier>,
    ) -> Self {
        Self {
            settings,
            fetcher,
            scores,
            opener,
            verifier,
        }
    }

    /// Run one bulk attempt. Whatever the result, no downloaded or partially
    /// unpacked file is left in the repository directory unless installed.
    pub async fn sync(
        &self,
        ctx: &mut SyncContext,
        tier: ProtocolTier,
        abort: &AbortSignal,
    ) -> BulkResult {
        let result = self.run(ctx, tier, abort).await;
        ctx.artifacts.discard();
        match &result {
            BulkResult::Failed(reason) => ctx.error(format!("{tier} sync failed: {reason}")),
            BulkResult::Unavailable(reason) => ctx.warn(format!("{tier} unavailable: {reason}")),
            _ => {}
        }
        result
    }

    async fn run(&self, ctx: &mut SyncContext, tier: ProtocolTier, abort: &AbortSignal) -> BulkResult {
        let developer = self.settings.effective_developer_mode();
        let Some(primary) = PayloadKind::primary_for(tier, developer) else {
            return BulkResult::Failed(format!("{tier} is not a bulk tier"));
        };
        let downloader = Downloader::new(self.fetcher.as_ref(), self.scores, self.settings.limits);

        let payload = match self.download_primary(ctx, &downloader, primary, abort).await {
            Ok(payload) => payload,
            Err(result) => return result,
        };

        // Best-effort detached signature.
        let payload_name = primary.file_name(ctx.repo.compression);
        let sig_name = signature_name(&payload_name);
        let sig_dest = ctx.repo.local_path.join(&sig_name);
        match downloader
            .download_from(&ctx.repo, &payload.mirror, &sig_name, &sig_dest, abort, &mut ctx.artifacts)
            .await
        {
            Ok(_) => {}
            Err(DownloadError::Aborted) => return BulkResult::Aborted,
            Err(e) => tracing::info!(repository = %ctx.repo.id, "no signature: {e}"),
        }

        // The checksum manifest is mandatory.
        let Some(checksum_kind) = primary.checksum_companion() else {
            return BulkResult::Failed(format!("{primary:?} has no checksum manifest"));
        };
        let manifest_dest = ctx.repo.local_file(checksum_kind);
        let manifest_name = checksum_kind.file_name(ctx.repo.compression);
        match downloader
            .download_from(
                &ctx.repo,
                &payload.mirror,
                &manifest_name,
                &manifest_dest,
                abort,
                &mut ctx.artifacts,
            )
            .await
        {
            Ok(_) => {}
            Err(DownloadError::Aborted) => return BulkResult::Aborted,
            Err(e) => return BulkResult::Failed(format!("cannot fetch checksum: {e}")),
        }

        match verify_against_manifest(&payload.path, &manifest_dest) {
            Ok(true) => tracing::debug!(repository = %ctx.repo.id, "checksum verified"),
            Ok(false) => {
                self.scores
                    .record_failure(&payload.mirror, FailureSeverity::ChecksumMismatch);
                return BulkResult::Failed(format!("checksum mismatch for {payload_name}"));
            }
            Err(e) => return BulkResult::Failed(e.to_string()),
        }

        let staging = match self.stage_extras(ctx, &downloader, &payload.mirror, abort).await {
            Ok(staging) => staging,
            Err(result) => return result,
        };

        let signatures = match self.check_signatures(ctx, &payload, &staging).await {
            Ok(report) => report,
            Err(reason) => return BulkResult::Failed(reason),
        };

        let unpacked = match tier {
            ProtocolTier::LightDatabase => self.unpack_database(ctx, &payload.path),
            _ => self.unpack_dump(ctx, &payload.path),
        };
        let temp_db = match unpacked {
            Ok(path) => path,
            Err(reason) => return BulkResult::Failed(reason),
        };

        let db_path = ctx.repo.database_path();
        if tier == ProtocolTier::CompressedDump && db_path.is_file() {
            self.align(ctx, &db_path, &temp_db);
        }

        if let Err(e) = std::fs::rename(&temp_db, &db_path) {
            return BulkResult::Failed(format!("cannot install {}: {e}", db_path.display()));
        }
        ctx.artifacts.release(&temp_db);
        tracing::info!(repository = %ctx.repo.id, %tier, "database installed");

        self.install_extras(ctx, staging);

        BulkResult::Installed {
            tier,
            mirror: payload.mirror,
            signatures,
        }
    }

    async fn download_primary(
        &self,
        ctx: &mut SyncContext,
        downloader: &Downloader<'_>,
        primary: PayloadKind,
        abort: &AbortSignal,
    ) -> Result<DownloadedArtifact, BulkResult> {
        let scoped = abort.child();
        let watch = ctx.repo.metadata_mirrors.first().map(|mirror| {
            LockWatch::spawn(
                Arc::clone(&self.fetcher),
                ctx.repo.remote_url(mirror, PayloadKind::DownloadLock),
                self.settings.lock_poll_interval,
                scoped.clone(),
            )
        });

        let downloaded = downloader
            .download_rotating(&ctx.repo, primary, &scoped, &mut ctx.artifacts)
            .await;
        let locked = match watch {
            Some(watch) => watch.stop().await,
            None => false,
        };

        match downloaded {
            Ok(payload) => Ok(payload),
            Err(DownloadError::Aborted) if locked && !abort.is_interrupted() => {
                Err(BulkResult::RemoteLocked)
            }
            Err(DownloadError::Aborted) => Err(BulkResult::Aborted),
            Err(e) => Err(BulkResult::Unavailable(e.to_string())),
        }
    }

    /// Metadata bundle, its signature and the notice board. All optional.
    async fn stage_extras(
        &self,
        ctx: &mut SyncContext,
        downloader: &Downloader<'_>,
        mirror: &str,
        abort: &AbortSignal,
    ) -> Result<Staging, BulkResult> {
        let dir = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&ctx.repo.local_path)
            .map_err(|e| BulkResult::Failed(format!("cannot create staging directory: {e}")))?;
        let compression = ctx.repo.compression;
        let mut archive = None;
        let mut bundle = Vec::new();
        let mut notice = None;

        let name = PayloadKind::MetaBundle.file_name(compression);
        let dest = dir.path().join(&name);
        match downloader
            .download_from(&ctx.repo, mirror, &name, &dest, abort, &mut ctx.artifacts)
            .await
        {
            Ok(artifact) => archive = Some(artifact.path),
            Err(DownloadError::Aborted) => return Err(BulkResult::Aborted),
            Err(e) => tracing::debug!(repository = %ctx.repo.id, "no metadata bundle: {e}"),
        }

        if let Some(archive) = &archive {
            let name = PayloadKind::MetaBundleSignature.file_name(compression);
            let dest = dir.path().join(&name);
            if let Err(DownloadError::Aborted) = downloader
                .download_from(&ctx.repo, mirror, &name, &dest, abort, &mut ctx.artifacts)
                .await
            {
                return Err(BulkResult::Aborted);
            }

            let out = dir.path().join(BUNDLE_DIR);
            let unpacked = std::fs::create_dir(&out)
                .map_err(|e| e.to_string())
                .and_then(|()| unpack_bundle(archive, &out).map_err(|e| e.to_string()));
            match unpacked {
                Ok(files) => bundle = files,
                Err(e) => ctx.warn(format!("ignoring damaged metadata bundle: {e}")),
            }
        }

        let name = PayloadKind::NoticeBoard.file_name(compression);
        let dest = dir.path().join(&name);
        match downloader
            .download_from(&ctx.repo, mirror, &name, &dest, abort, &mut ctx.artifacts)
            .await
        {
            Ok(artifact) => notice = Some(artifact.path),
            Err(DownloadError::Aborted) => return Err(BulkResult::Aborted),
            Err(_) => {}
        }

        Ok(Staging {
            dir,
            archive,
            bundle,
            notice,
        })
    }

    /// Install the repository key if shipped and check every signed download.
    ///
    /// Bad signatures are security warnings. They only fail the sync when the
    /// repository requires signatures.
    async fn check_signatures(
        &self,
        ctx: &mut SyncContext,
        payload: &DownloadedArtifact,
        staging: &Staging,
    ) -> Result<Option<SignatureReport>, String> {
        if !self.settings.gpg {
            return Ok(None);
        }
        let Some(verifier) = self.verifier else {
            if ctx.repo.require_signature {
                ctx.warn("signature required but no verifier available, skipping check");
            }
            return Ok(None);
        };

        let key = staging
            .bundle
            .iter()
            .find(|p| p.file_name().is_some_and(|n| n == PUBLIC_KEY_FILE))
            .cloned()
            .unwrap_or_else(|| ctx.repo.local_path.join(PUBLIC_KEY_FILE));
        let key_ready = ensure_repository_key(verifier, &ctx.repo.id, &key, &mut ctx.feedback).await;
        if !key_ready {
            if ctx.repo.require_signature {
                return Err("signature required but the repository key is unavailable".into());
            }
            return Ok(None);
        }

        let mut files = vec![payload.path.clone()];
        files.extend(staging.archive.iter().cloned());
        let report = verify_downloads(verifier, &ctx.repo.id, &files, &mut ctx.feedback).await;
        if ctx.repo.require_signature && !report.fully_signed() {
            return Err("signature required but verification did not pass".into());
        }
        Ok(Some(report))
    }

    fn unpack_database(&self, ctx: &mut SyncContext, payload: &Path) -> Result<PathBuf, String> {
        let temp_db = ctx.repo.local_path.join(TEMP_DATABASE);
        ctx.artifacts.track(&temp_db);
        decompress(ctx.repo.compression, payload, &temp_db).map_err(|e| e.to_string())?;
        self.opener
            .validate(&temp_db)
            .map_err(|e| format!("downloaded database unusable: {e}"))?;
        Ok(temp_db)
    }

    fn unpack_dump(&self, ctx: &mut SyncContext, payload: &Path) -> Result<PathBuf, String> {
        let dump = ctx.repo.local_path.join(DUMP_FILE);
        let temp_db = ctx.repo.local_path.join(TEMP_DATABASE);
        ctx.artifacts.track(&dump);
        ctx.artifacts.track(&temp_db);
        decompress(ctx.repo.compression, payload, &dump).map_err(|e| e.to_string())?;
        match std::fs::remove_file(&temp_db) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(format!("cannot clear {}: {e}", temp_db.display())),
        }
        self.opener
            .import_dump(&dump, &temp_db)
            .map_err(|e| format!("cannot import dump: {e}"))?;
        Ok(temp_db)
    }

    /// Carry local-only annotations from the installed database into the new
    /// one. On error the fresh import stays authoritative.
    fn align(&self, ctx: &mut SyncContext, old_path: &Path, new_path: &Path) {
        let result = self.opener.open(old_path).and_then(|old| {
            let mut new = match self.opener.open(new_path) {
                Ok(new) => new,
                Err(e) => {
                    let _ = old.close();
                    return Err(e);
                }
            };
            let carried = align_annotations(old.as_ref(), new.as_mut());
            let _ = old.close();
            let _ = new.close();
            carried
        });
        match result {
            Ok(0) => {}
            Ok(n) => tracing::debug!(repository = %ctx.repo.id, carried = n, "aligned local annotations"),
            Err(e) => ctx.warn(format!("could not carry local state over, using fresh database: {e}")),
        }
    }

    /// Apply the bundle's removal list, then move staged files into place.
    fn install_extras(&self, ctx: &mut SyncContext, staging: Staging) {
        let local = ctx.repo.local_path.clone();
        let protected = |name: &str| name == DATABASE_FILE || name == REVISION_FILE;

        if let Some(list) = staging
            .bundle
            .iter()
            .find(|p| p.file_name().is_some_and(|n| n == META_NOT_FOUND_FILE))
        {
            let names = std::fs::read_to_string(list).unwrap_or_default();
            for name in names.lines().map(str::trim).filter(|n| !n.is_empty()) {
                let Some(base) = Path::new(name).file_name().and_then(|b| b.to_str()) else {
                    continue;
                };
                if protected(base) {
                    continue;
                }
                match std::fs::remove_file(local.join(base)) {
                    Ok(()) => tracing::debug!(repository = %ctx.repo.id, file = base, "removed stale file"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => ctx.warn(format!("cannot remove {base}: {e}")),
                }
            }
        }

        let staged = staging.bundle.iter().chain(staging.notice.iter());
        for file in staged {
            let Some(name) = file.file_name() else {
                continue;
            };
            if name == META_NOT_FOUND_FILE || name.to_str().is_some_and(protected) {
                continue;
            }
            if let Err(e) = std::fs::rename(file, local.join(name)) {
                ctx.warn(format!("cannot install {}: {e}", Path::new(name).display()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use crate::repository::RepositoryDescriptor;
    use crate::store::{Annotation, MetadataStore, PackageRecord};
    use crate::test_support::{
        FakeFetcher, FakeResponse, FakeVerifier, InMemoryStoreOpener, StoreData, bundle_bytes,
        bzip2_bytes, md5_hex, repository, sample_records,
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        repo: RepositoryDescriptor,
        fetcher: Arc<FakeFetcher>,
        scores: MirrorScores,
        opener: InMemoryStoreOpener,
        settings: SyncSettings,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let repo = repository(dir.path(), &["http://a", "http://b"]);
            std::fs::create_dir_all(&repo.local_path).unwrap();
            Self {
                _dir: dir,
                repo,
                fetcher: Arc::new(FakeFetcher::new()),
                scores: MirrorScores::new(30),
                opener: InMemoryStoreOpener::new(),
                settings: SyncSettings::default(),
            }
        }

        fn url(&self, mirror: &str, kind: PayloadKind) -> String {
            self.repo.remote_url(mirror, kind)
        }

        /// Publish `payload` (already compressed) with a matching manifest.
        fn publish(&self, mirror: &str, kind: PayloadKind, payload: Vec<u8>) {
            let manifest = format!("{}  {}\n", md5_hex(&payload), kind.file_name(self.repo.compression));
            self.fetcher.insert(&self.url(mirror, kind), FakeResponse::Body(payload));
            if let Some(ck) = kind.checksum_companion() {
                self.fetcher.insert(&self.url(mirror, ck), FakeResponse::body(manifest));
            }
        }

        fn local_files(&self) -> BTreeSet<String> {
            std::fs::read_dir(&self.repo.local_path)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect()
        }

        async fn sync(&self, tier: ProtocolTier, verifier: Option<&dyn SignatureVerifier>) -> (BulkResult, SyncContext) {
            let engine = BulkSyncEngine::new(
                &self.settings,
                self.fetcher.clone(),
                &self.scores,
                &self.opener,
                verifier,
            );
            let mut ctx = SyncContext::new(self.repo.clone(), tier);
            let result = engine.sync(&mut ctx, tier, &AbortSignal::new()).await;
            (result, ctx)
        }
    }

    fn database(count: i64) -> Vec<u8> {
        bzip2_bytes(&StoreData::with_records(sample_records(count)).to_bytes())
    }

    #[tokio::test]
    async fn tier_one_installs_light_database() {
        let fx = Fixture::new();
        fx.publish("http://a", PayloadKind::DbLight, database(3));

        let (result, ctx) = fx.sync(ProtocolTier::LightDatabase, None).await;

        assert!(matches!(result, BulkResult::Installed { tier: ProtocolTier::LightDatabase, .. }));
        let installed = StoreData::read(&fx.repo.database_path()).unwrap();
        assert_eq!(installed.records.len(), 3);
        assert_eq!(fx.local_files(), BTreeSet::from(["packages.db".to_string()]));
        assert!(ctx.artifacts.is_empty());
    }

    #[tokio::test]
    async fn developer_mode_fetches_full_database() {
        let mut fx = Fixture::new();
        fx.settings.developer_mode = true;
        fx.publish("http://a", PayloadKind::Db, database(2));

        let (result, _) = fx.sync(ProtocolTier::LightDatabase, None).await;

        assert!(matches!(result, BulkResult::Installed { .. }));
        assert!(fx.fetcher.attempts_for(&fx.url("http://a", PayloadKind::Db)) == 1);
        assert_eq!(fx.fetcher.attempts_for(&fx.url("http://a", PayloadKind::DbLight)), 0);
    }

    #[tokio::test]
    async fn missing_payload_everywhere_is_unavailable() {
        let fx = Fixture::new();
        let (result, _) = fx.sync(ProtocolTier::CompressedDump, None).await;
        assert!(matches!(result, BulkResult::Unavailable(_)));
        assert!(fx.local_files().is_empty());
    }

    #[tokio::test]
    async fn missing_manifest_fails_and_cleans_up() {
        let fx = Fixture::new();
        StoreData::with_records(sample_records(5)).write(&fx.repo.database_path());
        let before = std::fs::read(fx.repo.database_path()).unwrap();
        fx.fetcher.insert(
            &fx.url("http://a", PayloadKind::DbLight),
            FakeResponse::Body(database(3)),
        );

        let (result, _) = fx.sync(ProtocolTier::LightDatabase, None).await;

        assert!(matches!(result, BulkResult::Failed(_)));
        assert_eq!(fx.local_files(), BTreeSet::from(["packages.db".to_string()]));
        assert_eq!(std::fs::read(fx.repo.database_path()).unwrap(), before);
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_without_replacing() {
        let fx = Fixture::new();
        StoreData::with_records(sample_records(5)).write(&fx.repo.database_path());
        let before = std::fs::read(fx.repo.database_path()).unwrap();
        fx.fetcher.insert(
            &fx.url("http://a", PayloadKind::DbLight),
            FakeResponse::Body(database(3)),
        );
        fx.fetcher.insert(
            &fx.url("http://a", PayloadKind::DbLightChecksum),
            FakeResponse::body("0123456789abcdef0123456789abcdef  packages.db.light.bz2\n"),
        );

        let (result, ctx) = fx.sync(ProtocolTier::LightDatabase, None).await;

        assert!(matches!(result, BulkResult::Failed(ref r) if r.contains("checksum")));
        assert_eq!(fx.local_files(), BTreeSet::from(["packages.db".to_string()]));
        assert_eq!(std::fs::read(fx.repo.database_path()).unwrap(), before);
        assert_eq!(fx.scores.score("http://a").score, 1);
        assert!(ctx.feedback.iter().any(|f| f.is_error()));
    }

    #[tokio::test]
    async fn corrupt_archive_fails_cleanly() {
        let fx = Fixture::new();
        fx.publish("http://a", PayloadKind::DbLight, b"not bzip2 at all".to_vec());

        let (result, _) = fx.sync(ProtocolTier::LightDatabase, None).await;

        assert!(matches!(result, BulkResult::Failed(ref r) if r.contains("corrupt")));
        assert!(fx.local_files().is_empty());
    }

    #[tokio::test]
    async fn unusable_database_fails_cleanly() {
        let fx = Fixture::new();
        fx.publish("http://a", PayloadKind::DbLight, bzip2_bytes(b"garbage"));

        let (result, _) = fx.sync(ProtocolTier::LightDatabase, None).await;

        assert!(matches!(result, BulkResult::Failed(_)));
        assert!(fx.local_files().is_empty());
    }

    #[tokio::test]
    async fn dump_import_preserves_local_annotations() {
        let fx = Fixture::new();
        let mut old = StoreData::with_records(sample_records(2));
        old.annotations.push(Annotation {
            atom: "app-misc/pkg1-1.0".into(),
            key: "masked".into(),
            value: "user".into(),
        });
        old.annotations.push(Annotation {
            atom: "app-misc/gone-1.0".into(),
            key: "masked".into(),
            value: "user".into(),
        });
        old.write(&fx.repo.database_path());
        fx.publish("http://a", PayloadKind::DumpLight, database(4));

        let (result, _) = fx.sync(ProtocolTier::CompressedDump, None).await;

        assert!(matches!(result, BulkResult::Installed { tier: ProtocolTier::CompressedDump, .. }));
        let installed = StoreData::read(&fx.repo.database_path()).unwrap();
        assert_eq!(installed.records.len(), 4);
        assert_eq!(installed.annotations.len(), 1);
        assert_eq!(installed.annotations[0].atom, "app-misc/pkg1-1.0");
        assert_eq!(fx.local_files(), BTreeSet::from(["packages.db".to_string()]));
    }

    #[tokio::test]
    async fn bad_dump_fails_and_keeps_old_database() {
        let fx = Fixture::new();
        StoreData::with_records(sample_records(2)).write(&fx.repo.database_path());
        fx.publish("http://a", PayloadKind::DumpLight, bzip2_bytes(b"CREATE TABLE nonsense"));

        let (result, _) = fx.sync(ProtocolTier::CompressedDump, None).await;

        assert!(matches!(result, BulkResult::Failed(_)));
        assert_eq!(StoreData::read(&fx.repo.database_path()).unwrap().records.len(), 2);
        assert_eq!(fx.local_files(), BTreeSet::from(["packages.db".to_string()]));
    }

    #[tokio::test]
    async fn metadata_bundle_is_installed_after_database() {
        let fx = Fixture::new();
        std::fs::write(fx.repo.local_path.join("stale.conf"), b"x").unwrap();
        fx.publish("http://a", PayloadKind::DbLight, database(1));
        fx.fetcher.insert(
            &fx.url("http://a", PayloadKind::MetaBundle),
            FakeResponse::Body(bundle_bytes(&[
                ("packages.db.meta_notfound", "stale.conf\npackages.db\n"),
                ("packages.db.mirrors", "http://a\n"),
                ("packages.db.post_update.sh", "exit 0\n"),
            ])),
        );
        fx.fetcher.insert(
            &fx.url("http://a", PayloadKind::NoticeBoard),
            FakeResponse::body("<rss/>"),
        );

        let (result, _) = fx.sync(ProtocolTier::LightDatabase, None).await;

        assert!(matches!(result, BulkResult::Installed { .. }));
        assert_eq!(
            fx.local_files(),
            BTreeSet::from([
                "notice.rss".to_string(),
                "packages.db".to_string(),
                "packages.db.mirrors".to_string(),
                "packages.db.post_update.sh".to_string(),
            ])
        );
    }

    #[tokio::test]
    async fn signatures_are_checked_when_a_key_ships() {
        let fx = Fixture::new();
        fx.publish("http://a", PayloadKind::DbLight, database(1));
        fx.fetcher.insert(
            &format!("{}.asc", fx.url("http://a", PayloadKind::DbLight)),
            FakeResponse::body("forged"),
        );
        fx.fetcher.insert(
            &fx.url("http://a", PayloadKind::MetaBundle),
            FakeResponse::Body(bundle_bytes(&[("signature.asc", "PUBLIC KEY")])),
        );
        let verifier = FakeVerifier::accepting("trusted");

        let (result, ctx) = fx.sync(ProtocolTier::LightDatabase, Some(&verifier)).await;

        let BulkResult::Installed { signatures: Some(report), .. } = result else {
            panic!("expected install with signature report, got {result:?}");
        };
        assert_eq!(report.invalid.len(), 1);
        assert_eq!(verifier.installs(), 1);
        assert!(ctx.feedback.iter().any(|f| matches!(f, crate::Feedback::Security(_))));
        assert!(fx.repo.local_path.join("signature.asc").exists());
    }

    #[tokio::test]
    async fn required_signature_blocks_install() {
        let mut fx = Fixture::new();
        fx.repo.require_signature = true;
        fx.publish("http://a", PayloadKind::DbLight, database(1));
        fx.fetcher.insert(
            &fx.url("http://a", PayloadKind::MetaBundle),
            FakeResponse::Body(bundle_bytes(&[("signature.asc", "PUBLIC KEY")])),
        );
        let verifier = FakeVerifier::accepting("trusted");

        let (result, _) = fx.sync(ProtocolTier::LightDatabase, Some(&verifier)).await;

        assert!(matches!(result, BulkResult::Failed(ref r) if r.contains("signature")));
        assert!(!fx.repo.database_path().exists());
        assert!(fx.local_files().is_empty());
    }

    #[tokio::test]
    async fn interrupted_download_removes_partial_file() {
        let fx = Fixture::new();
        let url = fx.url("http://a", PayloadKind::DumpLight);
        fx.fetcher.insert(&url, FakeResponse::Hang);
        let engine = BulkSyncEngine::new(
            &fx.settings,
            fx.fetcher.clone(),
            &fx.scores,
            &fx.opener,
            None,
        );
        let mut ctx = SyncContext::new(fx.repo.clone(), ProtocolTier::CompressedDump);
        let abort = AbortSignal::new();
        let interrupter = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            interrupter.interrupt();
        });

        let result = engine.sync(&mut ctx, ProtocolTier::CompressedDump, &abort).await;

        assert_eq!(result, BulkResult::Aborted);
        assert!(fx.local_files().is_empty());
        assert_eq!(fx.fetcher.attempts_for(&fx.url("http://b", PayloadKind::DumpLight)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_appearing_mid_download_reports_locked() {
        let mut fx = Fixture::new();
        fx.settings.lock_poll_interval = std::time::Duration::from_secs(1);
        fx.fetcher.insert(&fx.url("http://a", PayloadKind::DbLight), FakeResponse::Hang);
        fx.fetcher.insert(
            &fx.url("http://a", PayloadKind::DownloadLock),
            FakeResponse::body("locked"),
        );

        let (result, _) = fx.sync(ProtocolTier::LightDatabase, None).await;

        assert_eq!(result, BulkResult::RemoteLocked);
        assert!(fx.local_files().is_empty());
    }

    #[test]
    fn annotation_alignment_skips_vanished_atoms() {
        let dir = tempfile::tempdir().unwrap();
        let opener = InMemoryStoreOpener::new();
        let old_path = dir.path().join("old");
        let new_path = dir.path().join("new");
        let mut old = StoreData::with_records([PackageRecord::new(1, "a/b-1", 0)]);
        old.annotations.push(Annotation {
            atom: "a/b-1".into(),
            key: "k".into(),
            value: "v".into(),
        });
        old.write(&old_path);
        StoreData::with_records([PackageRecord::new(9, "a/b-1", 0)]).write(&new_path);

        let old = opener.open(&old_path).unwrap();
        let mut new = opener.open(&new_path).unwrap();
        assert_eq!(align_annotations(old.as_ref(), new.as_mut()).unwrap(), 1);
        assert_eq!(new.annotations().unwrap().len(), 1);
    }
}
