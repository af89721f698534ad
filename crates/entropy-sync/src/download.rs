use std::path::{Path, PathBuf};

use crate::artifact::ArtifactSet;
use crate::fetch::{AbortSignal, FetchOutcome, FetchRequest, Fetcher};
use crate::mirror::{FailureSeverity, MirrorScores};
use crate::payload::PayloadKind;
use crate::repository::RepositoryDescriptor;
use crate::settings::SyncLimits;

/// A payload that landed on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedArtifact {
    pub kind: Option<PayloadKind>,
    pub url: String,
    pub path: PathBuf,
    pub mirror: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DownloadError {
    /// No mirror could provide the item.
    #[error("{file} unavailable: {reason}")]
    Unavailable { file: String, reason: String },

    #[error("download aborted")]
    Aborted,
}

/// Drives the fetcher across mirrors with in-place timeout retries.
pub struct Downloader<'a> {
    fetcher: &'a dyn Fetcher,
    scores: &'a MirrorScores,
    limits: SyncLimits,
}

impl<'a> Downloader<'a> {
    pub fn new(fetcher: &'a dyn Fetcher, scores: &'a MirrorScores, limits: SyncLimits) -> Self {
        Self {
            fetcher,
            scores,
            limits,
        }
    }

    /// Download `kind` from the first mirror that has it, rotating through
    /// the repository's metadata mirrors and scoring failures.
    pub async fn download_rotating(
        &self,
        repo: &RepositoryDescriptor,
        kind: PayloadKind,
        abort: &AbortSignal,
        artifacts: &mut ArtifactSet,
    ) -> Result<DownloadedArtifact, DownloadError> {
        let file = kind.file_name(repo.compression);
        let dest = repo.local_file(kind);
        let mut rotation = self.scores.rotation(&repo.metadata_mirrors);
        let mut reason = String::from("no eligible mirror");

        while let Some(mirror) = rotation.next_mirror() {
            let url = repo.remote_url(&mirror, kind);
            tracing::info!(repository = %repo.id, %url, "downloading");
            let severity = match self.fetch(&url, &dest, abort, artifacts).await {
                FetchOutcome::Success(stats) => {
                    tracing::debug!(bytes = stats.bytes, resumed = stats.resumed, "download complete");
                    rotation.record_success(&mirror);
                    return Ok(DownloadedArtifact {
                        kind: Some(kind),
                        url,
                        path: dest,
                        mirror,
                    });
                }
                FetchOutcome::Aborted => return Err(DownloadError::Aborted),
                FetchOutcome::NotFound => {
                    reason = format!("not found on {mirror}");
                    FailureSeverity::NotFound
                }
                FetchOutcome::ChecksumMismatch => {
                    reason = format!("checksum mismatch from {mirror}");
                    FailureSeverity::ChecksumMismatch
                }
                FetchOutcome::Timeout => {
                    reason = format!("{mirror} kept timing out");
                    FailureSeverity::Other
                }
                FetchOutcome::GenericError(e) => {
                    reason = format!("{mirror}: {e}");
                    FailureSeverity::Other
                }
            };
            tracing::warn!(repository = %repo.id, file = %file, %reason, "mirror failed");
            rotation.record_failure(&mirror, severity);
            remove_partial(&dest);
        }

        Err(DownloadError::Unavailable { file, reason })
    }

    /// Download one named file from a specific mirror without scoring it.
    pub async fn download_from(
        &self,
        repo: &RepositoryDescriptor,
        mirror: &str,
        file_name: &str,
        dest: &Path,
        abort: &AbortSignal,
        artifacts: &mut ArtifactSet,
    ) -> Result<DownloadedArtifact, DownloadError> {
        let url = repo.remote_file_url(mirror, file_name);
        match self.fetch(&url, dest, abort, artifacts).await {
            FetchOutcome::Success(_) => Ok(DownloadedArtifact {
                kind: None,
                url,
                path: dest.to_path_buf(),
                mirror: mirror.to_string(),
            }),
            FetchOutcome::Aborted => Err(DownloadError::Aborted),
            other => {
                remove_partial(dest);
                Err(DownloadError::Unavailable {
                    file: file_name.to_string(),
                    reason: format!("{other:?}"),
                })
            }
        }
    }

    /// One mirror, with timeouts retried in place and a resumed transfer that
    /// fails retried once from scratch.
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        abort: &AbortSignal,
        artifacts: &mut ArtifactSet,
    ) -> FetchOutcome {
        remove_partial(dest);
        artifacts.track(dest);

        let mut request = FetchRequest::new(url, dest);
        let mut timeouts = 0;
        let mut restarted = false;
        loop {
            let outcome = self.fetcher.fetch(&request, abort).await;
            match outcome {
                FetchOutcome::Timeout if abort.is_raised() => return FetchOutcome::Aborted,
                FetchOutcome::Timeout if timeouts < self.limits.timeout_retries => {
                    timeouts += 1;
                    tracing::debug!(%url, attempt = timeouts, "timed out, retrying in place");
                    request.resume = true;
                }
                FetchOutcome::GenericError(ref e) if request.resume && !restarted => {
                    tracing::debug!(%url, "resumed transfer failed ({e}), restarting");
                    restarted = true;
                    request.resume = false;
                    remove_partial(dest);
                }
                other => return other,
            }
        }
    }
}

fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "cannot remove partial file: {e}"),
    }
}
