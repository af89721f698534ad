use std::path::Path;
use std::time::Duration;

use entropy_sync::checksum::file_md5;
use entropy_sync::fetch::{AbortSignal, FetchOutcome, FetchRequest, FetchStats, Fetcher};
use entropy_sync::settings::Timeouts;
use reqwest::StatusCode;
use reqwest::header::RANGE;
use tokio::io::AsyncWriteExt;

/// How often a blocked transfer looks at the abort signal.
const ABORT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("not found")]
    NotFound,

    #[error("transfer timed out")]
    Timeout,

    #[error("aborted")]
    Aborted,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("cannot build HTTP client: {0}")]
    Client(String),
}

impl From<FetchError> for FetchOutcome {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::NotFound => FetchOutcome::NotFound,
            FetchError::Timeout => FetchOutcome::Timeout,
            FetchError::Aborted => FetchOutcome::Aborted,
            other => FetchOutcome::GenericError(other.to_string()),
        }
    }
}

fn http_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Http(e.to_string())
    }
}

fn io_error(e: std::io::Error) -> FetchError {
    FetchError::Io(e.to_string())
}

/// Transport fetcher for `http(s)://` and `file://` URLs.
///
/// Partial downloads are resumed with a `Range` request when asked to; a
/// server that ignores the range gets the file rewritten from the start.
pub struct HttpFetcher {
    client: reqwest::Client,
    timeouts: Timeouts,
}

impl HttpFetcher {
    pub fn new(timeouts: Timeouts) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .connect_timeout(timeouts.control)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self { client, timeouts })
    }

    async fn download(
        &self,
        request: &FetchRequest,
        abort: &AbortSignal,
    ) -> Result<FetchStats, FetchError> {
        if abort.is_raised() {
            return Err(FetchError::Aborted);
        }
        if let Some(path) = request.url.strip_prefix("file://") {
            return copy_local(Path::new(path), &request.dest).await;
        }

        let offset = if request.resume {
            tokio::fs::metadata(&request.dest)
                .await
                .map(|m| m.len())
                .unwrap_or(0)
        } else {
            0
        };

        let mut req = self.client.get(&request.url);
        if offset > 0 {
            req = req.header(RANGE, format!("bytes={offset}-"));
        }

        let mut response = tokio::select! {
            sent = tokio::time::timeout(self.timeouts.transfer, req.send()) => match sent {
                Ok(response) => response.map_err(http_error)?,
                Err(_) => return Err(FetchError::Timeout),
            },
            _ = wait_for_abort(abort) => return Err(FetchError::Aborted),
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(FetchError::NotFound);
        }
        if !status.is_success() {
            return Err(FetchError::Http(format!("HTTP {status}")));
        }

        let resumed = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        let mut file = if resumed {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&request.dest)
                .await
        } else {
            tokio::fs::File::create(&request.dest).await
        }
        .map_err(io_error)?;

        let mut bytes = 0u64;
        loop {
            let chunk = tokio::select! {
                next = tokio::time::timeout(self.timeouts.transfer, response.chunk()) => match next {
                    Ok(chunk) => chunk.map_err(http_error)?,
                    Err(_) => return Err(FetchError::Timeout),
                },
                _ = wait_for_abort(abort) => return Err(FetchError::Aborted),
            };
            let Some(chunk) = chunk else {
                break;
            };
            file.write_all(&chunk).await.map_err(io_error)?;
            bytes += chunk.len() as u64;
        }
        file.flush().await.map_err(io_error)?;

        Ok(FetchStats { bytes, resumed })
    }
}

async fn copy_local(src: &Path, dest: &Path) -> Result<FetchStats, FetchError> {
    match tokio::fs::copy(src, dest).await {
        Ok(bytes) => Ok(FetchStats {
            bytes,
            resumed: false,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FetchError::NotFound),
        Err(e) => Err(io_error(e)),
    }
}

async fn wait_for_abort(abort: &AbortSignal) {
    while !abort.is_raised() {
        tokio::time::sleep(ABORT_POLL).await;
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest, abort: &AbortSignal) -> FetchOutcome {
        tracing::debug!(url = %request.url, resume = request.resume, "fetching");
        let existed = request.dest.exists();

        let stats = match self.download(request, abort).await {
            Ok(stats) => stats,
            Err(FetchError::Aborted) => {
                if !(existed && request.resume) {
                    let _ = tokio::fs::remove_file(&request.dest).await;
                }
                return FetchOutcome::Aborted;
            }
            Err(e) => {
                tracing::debug!(url = %request.url, "fetch failed: {e}");
                return e.into();
            }
        };

        if let Some(expected) = &request.expected_md5 {
            match file_md5(&request.dest) {
                Ok(actual) if actual.eq_ignore_ascii_case(expected) => {}
                Ok(_) => return FetchOutcome::ChecksumMismatch,
                Err(e) => return FetchOutcome::GenericError(e.to_string()),
            }
        }
        FetchOutcome::Success(stats)
    }

    async fn fetch_text(&self, url: &str) -> Option<String> {
        if let Some(path) = url.strip_prefix("file://") {
            return tokio::fs::read_to_string(path).await.ok();
        }
        let response = self
            .client
            .get(url)
            .timeout(self.timeouts.control)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.text().await.ok()
    }
}
