use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::checksum::{file_md5, repository_digest};
use crate::error::SyncError;
use crate::fetch::{AbortSignal, FetchOutcome, FetchRequest, FetchStats, Fetcher};
use crate::hooks::CacheInvalidator;
use crate::payload::CompressionFormat;
use crate::repository::{RepositoryDescriptor, RepositoryId, ServiceEndpoint};
use crate::service::{
    RepositoryQuery, ServiceConnection, ServiceConnector, ServiceError, SessionToken,
};
use crate::signature::{SignatureError, SignatureVerifier, Verification};
use crate::store::{
    Annotation, ChecksumOptions, MetadataStore, PackageId, PackageRecord, PackageSets,
    StoreError, StoreOpener, TreeUpdates,
};

/// Repository `main` with its local directory under `root`.
pub fn repository(root: &Path, mirrors: &[&str]) -> RepositoryDescriptor {
    RepositoryDescriptor {
        id: RepositoryId::new("main"),
        description: "Main repository".into(),
        metadata_mirrors: mirrors.iter().map(|m| m.to_string()).collect(),
        package_mirrors: mirrors.iter().map(|m| m.to_string()).collect(),
        local_path: root.join("main"),
        branch: "4".into(),
        product: "standard".into(),
        arch: "amd64".into(),
        compression: CompressionFormat::Bzip2,
        service: Some(ServiceEndpoint {
            host: "pkg.example.org".into(),
            port: ServiceEndpoint::DEFAULT_PORT,
        }),
        require_signature: false,
    }
}

/// `count` sequential records starting at id 1.
pub fn sample_records(count: i64) -> Vec<PackageRecord> {
    (1..=count)
        .map(|id| PackageRecord::new(id, format!("app-misc/pkg{id}-1.0"), 0))
        .collect()
}

pub fn bzip2_bytes(data: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    let _ = enc.write_all(data);
    enc.finish().unwrap_or_default()
}

/// A gzip-compressed tar with the given (name, content) entries.
pub fn bundle_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut archive = tar::Builder::new(encoder);
    for (name, content) in entries {
        let data = content.as_bytes();
        let mut header = tar::Header::new_gnu();
        let _ = header.set_path(name);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        let _ = archive.append(&header, data);
    }
    archive
        .into_inner()
        .and_then(|enc| enc.finish())
        .unwrap_or_default()
}

pub fn md5_hex(data: &[u8]) -> String {
    use md5::{Digest, Md5};
    hex::encode(Md5::digest(data))
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeResponse {
    Body(Vec<u8>),
    NotFound,
    Timeout,
    Error(String),
    /// Written to disk, then reported as failing its transfer-level digest.
    Corrupt(Vec<u8>),
    /// Never completes until the abort signal is raised.
    Hang,
}

impl FakeResponse {
    pub fn body(data: impl AsRef<[u8]>) -> Self {
        Self::Body(data.as_ref().to_vec())
    }
}

/// URL-keyed fetcher. Unknown URLs are `NotFound`.
///
/// A sequence of responses is consumed front to back; the last one sticks.
#[derive(Default)]
pub struct FakeFetcher {
    responses: Mutex<HashMap<String, VecDeque<FakeResponse>>>,
    attempts: Mutex<Vec<FetchRequest>>,
    text_requests: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, response: FakeResponse) {
        self.insert_sequence(url, vec![response]);
    }

    pub fn insert_sequence(&self, url: &str, responses: Vec<FakeResponse>) {
        self.responses
            .lock()
            .insert(url.to_string(), responses.into_iter().collect());
    }

    pub fn remove(&self, url: &str) {
        self.responses.lock().remove(url);
    }

    pub fn attempts(&self) -> Vec<FetchRequest> {
        self.attempts.lock().clone()
    }

    pub fn attempts_for(&self, url: &str) -> usize {
        self.attempts.lock().iter().filter(|r| r.url == url).count()
    }

    pub fn text_requests(&self) -> Vec<String> {
        self.text_requests.lock().clone()
    }

    /// Fetches of either kind.
    pub fn total_requests(&self) -> usize {
        self.attempts.lock().len() + self.text_requests.lock().len()
    }

    fn next_response(&self, url: &str) -> FakeResponse {
        let mut responses = self.responses.lock();
        match responses.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(FakeResponse::NotFound),
            Some(queue) => queue.front().cloned().unwrap_or(FakeResponse::NotFound),
            None => FakeResponse::NotFound,
        }
    }

    fn aborted(request: &FetchRequest, existed: bool) -> FetchOutcome {
        if !(existed && request.resume) {
            let _ = std::fs::remove_file(&request.dest);
        }
        FetchOutcome::Aborted
    }
}

#[async_trait::async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, request: &FetchRequest, abort: &AbortSignal) -> FetchOutcome {
        self.attempts.lock().push(request.clone());
        let existed = request.dest.exists();
        if abort.is_raised() {
            return Self::aborted(request, existed);
        }
        match self.next_response(&request.url) {
            FakeResponse::Body(data) => {
                if let Err(e) = std::fs::write(&request.dest, &data) {
                    return FetchOutcome::GenericError(e.to_string());
                }
                if let Some(expected) = &request.expected_md5 {
                    if md5_hex(&data) != *expected {
                        return FetchOutcome::ChecksumMismatch;
                    }
                }
                FetchOutcome::Success(FetchStats {
                    bytes: data.len() as u64,
                    resumed: false,
                })
            }
            FakeResponse::Corrupt(data) => {
                let _ = std::fs::write(&request.dest, &data);
                FetchOutcome::ChecksumMismatch
            }
            FakeResponse::NotFound => FetchOutcome::NotFound,
            FakeResponse::Timeout => FetchOutcome::Timeout,
            FakeResponse::Error(e) => FetchOutcome::GenericError(e),
            FakeResponse::Hang => {
                let _ = std::fs::write(&request.dest, b"partial");
                while !abort.is_raised() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Self::aborted(request, existed)
            }
        }
    }

    async fn fetch_text(&self, url: &str) -> Option<String> {
        self.text_requests.lock().push(url.to_string());
        match self.next_response(url) {
            FakeResponse::Body(data) => Some(String::from_utf8_lossy(&data).into_owned()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata store
// ---------------------------------------------------------------------------

/// Serialized content of an `InMemoryStore`; also the dump format its opener imports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreData {
    pub records: BTreeMap<PackageId, PackageRecord>,
    #[serde(default)]
    pub sets: PackageSets,
    #[serde(default)]
    pub tree_updates: Option<TreeUpdates>,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(default)]
    pub index_rebuilds: u32,
}

impl StoreData {
    pub fn with_records(records: impl IntoIterator<Item = PackageRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.id, r)).collect(),
            ..Default::default()
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn write(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(path, self.to_bytes());
    }

    pub fn read(path: &Path) -> Option<Self> {
        let raw = std::fs::read(path).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    pub fn checksum(&self) -> String {
        repository_digest(self.records.values(), ChecksumOptions::default())
    }
}

/// JSON-file-backed store. Writes land on disk at commit.
pub struct InMemoryStore {
    path: PathBuf,
    committed: StoreData,
    pending: Option<StoreData>,
    fail_insert: Option<PackageId>,
}

impl InMemoryStore {
    fn current(&self) -> &StoreData {
        self.pending.as_ref().unwrap_or(&self.committed)
    }

    fn mutate<T>(&mut self, f: impl FnOnce(&mut StoreData) -> T) -> Result<T, StoreError> {
        match self.pending.as_mut() {
            Some(pending) => Ok(f(pending)),
            None => {
                let out = f(&mut self.committed);
                self.persist()?;
                Ok(out)
            }
        }
    }

    fn persist(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&self.committed)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        std::fs::write(&self.path, bytes).map_err(|e| StoreError::Io(e.to_string()))
    }
}

impl MetadataStore for InMemoryStore {
    fn list_all_identifiers(&self) -> Result<BTreeSet<PackageId>, StoreError> {
        Ok(self.current().records.keys().copied().collect())
    }

    fn record(&self, id: PackageId) -> Result<Option<PackageRecord>, StoreError> {
        Ok(self.current().records.get(&id).cloned())
    }

    fn find_atoms(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .current()
            .records
            .values()
            .filter(|r| r.atom.starts_with(prefix))
            .map(|r| r.atom.clone())
            .collect())
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        if self.pending.is_none() {
            self.pending = Some(self.committed.clone());
        }
        Ok(())
    }

    fn insert_record(&mut self, record: &PackageRecord) -> Result<(), StoreError> {
        if self.fail_insert == Some(record.id) {
            return Err(StoreError::Database(format!("injected failure on {}", record.id)));
        }
        let record = record.clone();
        self.mutate(|d| {
            d.records.insert(record.id, record);
        })
    }

    fn remove_record(&mut self, id: PackageId) -> Result<(), StoreError> {
        let removed = self.mutate(|d| d.records.remove(&id))?;
        removed.map(|_| ()).ok_or(StoreError::NotFound(id))
    }

    fn package_sets(&self) -> Result<PackageSets, StoreError> {
        Ok(self.current().sets.clone())
    }

    fn replace_package_sets(&mut self, sets: &PackageSets) -> Result<(), StoreError> {
        let sets = sets.clone();
        self.mutate(|d| d.sets = sets)
    }

    fn tree_updates(&self) -> Result<Option<TreeUpdates>, StoreError> {
        Ok(self.current().tree_updates.clone())
    }

    fn set_tree_updates(&mut self, updates: &TreeUpdates) -> Result<(), StoreError> {
        let updates = updates.clone();
        self.mutate(|d| d.tree_updates = Some(updates))
    }

    fn setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.current().settings.get(key).cloned())
    }

    fn set_setting(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.mutate(|d| {
            d.settings.insert(key, value);
        })
    }

    fn annotations(&self) -> Result<Vec<Annotation>, StoreError> {
        Ok(self.current().annotations.clone())
    }

    fn set_annotation(&mut self, annotation: &Annotation) -> Result<(), StoreError> {
        let annotation = annotation.clone();
        self.mutate(|d| {
            d.annotations
                .retain(|a| !(a.atom == annotation.atom && a.key == annotation.key));
            d.annotations.push(annotation);
        })
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if let Some(pending) = self.pending.take() {
            self.committed = pending;
            self.persist()?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.pending = None;
        Ok(())
    }

    fn checksum(&self, options: ChecksumOptions) -> Result<String, StoreError> {
        Ok(repository_digest(self.current().records.values(), options))
    }

    fn rebuild_indexes(&mut self) -> Result<(), StoreError> {
        self.mutate(|d| d.index_rebuilds += 1)
    }

    fn close(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Opens `InMemoryStore`s; dumps are `StoreData` JSON.
#[derive(Default)]
pub struct InMemoryStoreOpener {
    fail_insert: Option<PackageId>,
    no_dump_import: bool,
    opens: AtomicUsize,
}

impl InMemoryStoreOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores fail when asked to insert this package.
    pub fn failing_insert(id: PackageId) -> Self {
        Self {
            fail_insert: Some(id),
            ..Self::default()
        }
    }

    pub fn without_dump_import() -> Self {
        Self {
            no_dump_import: true,
            ..Self::default()
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl StoreOpener for InMemoryStoreOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn MetadataStore>, StoreError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let committed = match std::fs::read(path) {
            Ok(raw) => {
                serde_json::from_slice(&raw).map_err(|e| StoreError::Corrupt(e.to_string()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let data = StoreData::default();
                std::fs::write(path, data.to_bytes()).map_err(|e| StoreError::Io(e.to_string()))?;
                data
            }
            Err(e) => return Err(StoreError::Io(e.to_string())),
        };
        Ok(Box::new(InMemoryStore {
            path: path.to_path_buf(),
            committed,
            pending: None,
            fail_insert: self.fail_insert,
        }))
    }

    fn import_dump(&self, dump: &Path, dest: &Path) -> Result<(), StoreError> {
        let raw = std::fs::read(dump).map_err(|e| StoreError::Io(e.to_string()))?;
        let data: StoreData =
            serde_json::from_slice(&raw).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        std::fs::write(dest, data.to_bytes()).map_err(|e| StoreError::Io(e.to_string()))
    }

    fn supports_dump_import(&self) -> bool {
        !self.no_dump_import
    }
}

// ---------------------------------------------------------------------------
// Differential service
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ServiceState {
    pub records: BTreeMap<PackageId, PackageRecord>,
    pub sets: PackageSets,
    pub tree_updates: TreeUpdates,
    pub library_ids: BTreeSet<PackageId>,
    pub refuse_connect: bool,
    pub locked: bool,
    pub malformed_diff: bool,
    /// Replies served to `package_records` before the real records.
    pub records_script: VecDeque<Value>,
    pub drop_metadata_key: Option<&'static str>,
    /// Overrides the computed remote checksum.
    pub checksum_override: Option<String>,
    pub connects: usize,
    pub sessions_opened: usize,
    pub sessions_closed: usize,
    pub disconnects: usize,
    pub record_requests: usize,
}

/// Differential service serving `ServiceState`.
#[derive(Clone, Default)]
pub struct FakeService {
    state: Arc<Mutex<ServiceState>>,
}

impl FakeService {
    pub fn new(records: impl IntoIterator<Item = PackageRecord>) -> Self {
        let service = Self::default();
        service.state.lock().records = records.into_iter().map(|r| (r.id, r)).collect();
        service
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut ServiceState) -> T) -> T {
        f(&mut self.state.lock())
    }

    pub fn sessions_balanced(&self) -> bool {
        let state = self.state.lock();
        state.sessions_opened == state.sessions_closed && state.connects == state.disconnects
    }
}

#[async_trait::async_trait]
impl ServiceConnector for FakeService {
    async fn connect(
        &self,
        endpoint: &ServiceEndpoint,
        _timeout: Duration,
    ) -> Result<Box<dyn ServiceConnection>, ServiceError> {
        let mut state = self.state.lock();
        if state.refuse_connect {
            return Err(ServiceError::Connect(endpoint.to_string()));
        }
        state.connects += 1;
        Ok(Box::new(FakeConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeConnection {
    state: Arc<Mutex<ServiceState>>,
}

#[async_trait::async_trait]
impl ServiceConnection for FakeConnection {
    async fn open_session(&mut self) -> Result<SessionToken, ServiceError> {
        let mut state = self.state.lock();
        state.sessions_opened += 1;
        Ok(SessionToken::new(format!("session-{}", state.sessions_opened)))
    }

    async fn close_session(&mut self, _session: &SessionToken) -> Result<(), ServiceError> {
        self.state.lock().sessions_closed += 1;
        Ok(())
    }

    async fn differential_comparison(
        &mut self,
        _session: &SessionToken,
        _query: &RepositoryQuery,
        local_ids: &BTreeSet<PackageId>,
    ) -> Result<Value, ServiceError> {
        let state = self.state.lock();
        if state.locked {
            return Ok(json!(false));
        }
        if state.malformed_diff {
            return Ok(json!("unexpected"));
        }
        let remote: BTreeSet<PackageId> = state.records.keys().copied().collect();
        let added: Vec<_> = remote.difference(local_ids).copied().collect();
        let removed: Vec<_> = local_ids.difference(&remote).copied().collect();
        let checksum = state.checksum_override.clone().unwrap_or_else(|| {
            repository_digest(state.records.values(), ChecksumOptions::default())
        });
        Ok(json!({
            "added": added,
            "removed": removed,
            "secure_checksum": checksum,
        }))
    }

    async fn package_records(
        &mut self,
        _session: &SessionToken,
        _query: &RepositoryQuery,
        ids: &[PackageId],
    ) -> Result<Value, ServiceError> {
        let mut state = self.state.lock();
        state.record_requests += 1;
        if let Some(reply) = state.records_script.pop_front() {
            return Ok(reply);
        }
        let mut map = serde_json::Map::new();
        for id in ids {
            if let Some(record) = state.records.get(id) {
                let value =
                    serde_json::to_value(record).map_err(|e| ServiceError::Protocol(e.to_string()))?;
                map.insert(id.to_string(), value);
            }
        }
        Ok(Value::Object(map))
    }

    async fn repository_metadata(
        &mut self,
        _session: &SessionToken,
        _query: &RepositoryQuery,
    ) -> Result<Value, ServiceError> {
        let state = self.state.lock();
        let mut reply = json!({
            "sets": state.sets,
            "treeupdates_actions": state.tree_updates.actions,
            "treeupdates_digest": state.tree_updates.digest,
            "library_idpackages": state.library_ids,
        });
        if let (Some(key), Some(map)) = (state.drop_metadata_key, reply.as_object_mut()) {
            map.remove(key);
        }
        Ok(reply)
    }

    async fn disconnect(&mut self) {
        self.state.lock().disconnects += 1;
    }
}

// ---------------------------------------------------------------------------
// Signatures and caches
// ---------------------------------------------------------------------------

/// Accepts a signature iff the signature file contains the configured token.
/// Key fingerprints are the md5 of the key file.
pub struct FakeVerifier {
    token: String,
    installed: Mutex<HashMap<RepositoryId, String>>,
    installs: AtomicUsize,
}

impl FakeVerifier {
    pub fn accepting(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            installed: Mutex::new(HashMap::new()),
            installs: AtomicUsize::new(0),
        }
    }

    pub fn installs(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SignatureVerifier for FakeVerifier {
    async fn verify(
        &self,
        _repo: &RepositoryId,
        _payload: &Path,
        signature: &Path,
    ) -> Result<Verification, SignatureError> {
        let content = std::fs::read_to_string(signature)
            .map_err(|e| SignatureError::Failed(e.to_string()))?;
        let valid = content.trim() == self.token;
        Ok(Verification {
            valid,
            message: if valid { "good signature".into() } else { "bad signature".into() },
        })
    }

    async fn install_key(&self, repo: &RepositoryId, key: &Path) -> Result<String, SignatureError> {
        let fingerprint = self.key_fingerprint(key).await?;
        self.installed.lock().insert(repo.clone(), fingerprint.clone());
        self.installs.fetch_add(1, Ordering::SeqCst);
        Ok(fingerprint)
    }

    async fn installed_fingerprint(
        &self,
        repo: &RepositoryId,
    ) -> Result<Option<String>, SignatureError> {
        Ok(self.installed.lock().get(repo).cloned())
    }

    async fn key_fingerprint(&self, key: &Path) -> Result<String, SignatureError> {
        file_md5(key).map_err(|e| SignatureError::Failed(e.to_string()))
    }
}

/// Records invalidations instead of touching disk.
#[derive(Default)]
pub struct RecordingCache {
    invalidated: Mutex<Vec<RepositoryId>>,
    clears: AtomicUsize,
}

impl RecordingCache {
    pub fn invalidated(&self) -> Vec<RepositoryId> {
        self.invalidated.lock().clone()
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl CacheInvalidator for RecordingCache {
    fn invalidate_repository(&self, repo: &RepositoryId) -> Result<(), SyncError> {
        self.invalidated.lock().push(repo.clone());
        Ok(())
    }

    fn clear_all(&self) -> Result<(), SyncError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
