use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation polled by fetchers between chunks.
///
/// The interrupt flag is process-wide (user interrupt). A child signal adds a
/// local flag that only cancels work started under it, such as the download
/// lock watch aborting one repository's transfer.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    interrupt: Arc<AtomicBool>,
    local: Option<Arc<AtomicBool>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that also trips when this one is interrupted.
    pub fn child(&self) -> Self {
        Self {
            interrupt: Arc::clone(&self.interrupt),
            local: Some(Arc::new(AtomicBool::new(false))),
        }
    }

    /// Abort work under this signal only.
    pub fn raise(&self) {
        match &self.local {
            Some(flag) => flag.store(true, Ordering::SeqCst),
            None => self.interrupt.store(true, Ordering::SeqCst),
        }
    }

    /// Abort everything, as a user interrupt does.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.is_interrupted()
            || self
                .local
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }
}

/// A single remote item to bring to a local path.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub dest: PathBuf,
    /// Continue from an existing partial file when the server allows it.
    pub resume: bool,
    /// Optional transfer-level check: hex md5 the finished file must match,
    /// otherwise the fetch ends in `ChecksumMismatch`. The bulk engine leaves
    /// it unset and verifies against the mirror's manifest after download.
    pub expected_md5: Option<String>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dest: dest.into(),
            resume: false,
            expected_md5: None,
        }
    }

    pub fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn expect_md5(mut self, digest: impl Into<String>) -> Self {
        self.expected_md5 = Some(digest.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchStats {
    pub bytes: u64,
    /// The transfer continued an existing partial file.
    pub resumed: bool,
}

/// Result of one fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success(FetchStats),
    NotFound,
    /// Only when an expected digest was supplied.
    ChecksumMismatch,
    Timeout,
    /// Cancelled through the abort signal. The partial file is already gone.
    Aborted,
    GenericError(String),
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Downloads one named remote item.
///
/// Implementations leave partial files in place on ordinary errors so a later
/// attempt can resume, and delete them when aborted unless the file existed
/// before the attempt and `resume` was requested.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest, abort: &AbortSignal) -> FetchOutcome;

    /// Fetch a small text item (revision marker, lock marker). `None` when the
    /// item does not exist or cannot be retrieved.
    async fn fetch_text(&self, url: &str) -> Option<String>;
}

#[async_trait::async_trait]
impl<T: Fetcher + ?Sized> Fetcher for Arc<T> {
    async fn fetch(&self, request: &FetchRequest, abort: &AbortSignal) -> FetchOutcome {
        (**self).fetch(request, abort).await
    }

    async fn fetch_text(&self, url: &str) -> Option<String> {
        (**self).fetch_text(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_signal_is_scoped() {
        let root = AbortSignal::new();
        let child = root.child();
        let sibling = root.child();
        child.raise();
        assert!(child.is_raised());
        assert!(!child.is_interrupted());
        assert!(!sibling.is_raised());
        assert!(!root.is_raised());
    }

    #[test]
    fn interrupt_reaches_every_child() {
        let root = AbortSignal::new();
        let child = root.child();
        root.interrupt();
        assert!(child.is_raised());
        assert!(child.is_interrupted());
    }

    #[test]
    fn raising_the_root_interrupts() {
        let root = AbortSignal::new();
        root.raise();
        assert!(root.is_interrupted());
    }
}
