use std::path::{Path, PathBuf};

use crate::feedback::Feedback;
use crate::payload::signature_name;
use crate::repository::RepositoryId;

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    /// No usable verification backend or key.
    #[error("signature checking unavailable: {0}")]
    Unavailable(String),

    #[error("repository key expired: {0}")]
    KeyExpired(String),

    #[error("signature check failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub valid: bool,
    pub message: String,
}

/// Signature and trust backend.
#[async_trait::async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify(
        &self,
        repo: &RepositoryId,
        payload: &Path,
        signature: &Path,
    ) -> Result<Verification, SignatureError>;

    /// Install the repository key and return its fingerprint.
    async fn install_key(&self, repo: &RepositoryId, key: &Path) -> Result<String, SignatureError>;

    async fn installed_fingerprint(
        &self,
        repo: &RepositoryId,
    ) -> Result<Option<String>, SignatureError>;

    /// Fingerprint of a key file without installing it.
    async fn key_fingerprint(&self, key: &Path) -> Result<String, SignatureError>;
}

/// Make sure the repository key at `key_path` is installed.
///
/// Returns whether signatures can be checked. A key that differs from the
/// installed one is reported and left alone.
pub async fn ensure_repository_key(
    verifier: &dyn SignatureVerifier,
    repo: &RepositoryId,
    key_path: &Path,
    feedback: &mut Vec<Feedback>,
) -> bool {
    if !key_path.exists() {
        tracing::debug!(repository = %repo, "repository ships no public key");
        return false;
    }

    let installed = match verifier.installed_fingerprint(repo).await {
        Ok(fp) => fp,
        Err(e) => {
            feedback.push(Feedback::warning(format!("{repo}: {e}")));
            return false;
        }
    };

    match installed {
        Some(current) => match verifier.key_fingerprint(key_path).await {
            Ok(shipped) if shipped == current => true,
            Ok(shipped) => {
                feedback.push(Feedback::security(format!(
                    "{repo}: repository key changed ({current} -> {shipped}), keeping the installed key"
                )));
                true
            }
            Err(e) => {
                feedback.push(Feedback::warning(format!("{repo}: {e}")));
                true
            }
        },
        None => match verifier.install_key(repo, key_path).await {
            Ok(fingerprint) => {
                feedback.push(Feedback::info(format!(
                    "{repo}: installed repository key {fingerprint}"
                )));
                true
            }
            Err(e) => {
                feedback.push(Feedback::warning(format!("{repo}: cannot install key: {e}")));
                false
            }
        },
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SignatureReport {
    pub verified: Vec<PathBuf>,
    pub invalid: Vec<PathBuf>,
    /// No `.asc` next to the file.
    pub unsigned: Vec<PathBuf>,
}

impl SignatureReport {
    pub fn is_clean(&self) -> bool {
        self.invalid.is_empty()
    }

    pub fn fully_signed(&self) -> bool {
        self.invalid.is_empty() && self.unsigned.is_empty()
    }
}

/// Check every file that has a detached signature next to it.
pub async fn verify_downloads(
    verifier: &dyn SignatureVerifier,
    repo: &RepositoryId,
    files: &[PathBuf],
    feedback: &mut Vec<Feedback>,
) -> SignatureReport {
    let mut report = SignatureReport::default();
    for file in files {
        let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let signature = file.with_file_name(signature_name(name));
        if !signature.exists() {
            report.unsigned.push(file.clone());
            continue;
        }
        match verifier.verify(repo, file, &signature).await {
            Ok(v) if v.valid => {
                tracing::debug!(repository = %repo, file = name, "signature ok");
                report.verified.push(file.clone());
            }
            Ok(v) => {
                feedback.push(Feedback::security(format!(
                    "{repo}: bad signature for {name}: {}",
                    v.message
                )));
                report.invalid.push(file.clone());
            }
            Err(e) => {
                feedback.push(Feedback::security(format!(
                    "{repo}: cannot verify {name}: {e}"
                )));
                report.invalid.push(file.clone());
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeVerifier;

    #[tokio::test]
    async fn verify_sorts_files_by_result() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("packages.db.light.bz2");
        let bad = dir.path().join("packages.db.meta");
        let plain = dir.path().join("notice.rss");
        for f in [&good, &bad, &plain] {
            std::fs::write(f, b"data").unwrap();
        }
        std::fs::write(dir.path().join("packages.db.light.bz2.asc"), b"good").unwrap();
        std::fs::write(dir.path().join("packages.db.meta.asc"), b"forged").unwrap();

        let verifier = FakeVerifier::accepting("good");
        let mut feedback = Vec::new();
        let report = verify_downloads(
            &verifier,
            &RepositoryId::new("main"),
            &[good.clone(), bad.clone(), plain.clone()],
            &mut feedback,
        )
        .await;

        assert_eq!(report.verified, vec![good]);
        assert_eq!(report.invalid, vec![bad]);
        assert_eq!(report.unsigned, vec![plain]);
        assert!(!report.is_clean());
        assert_eq!(feedback.len(), 1);
        assert!(matches!(feedback[0], Feedback::Security(_)));
    }

    #[tokio::test]
    async fn key_installed_once_and_change_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("signature.asc");
        let repo = RepositoryId::new("main");
        let verifier = FakeVerifier::accepting("good");
        let mut feedback = Vec::new();

        assert!(!ensure_repository_key(&verifier, &repo, &key, &mut feedback).await);

        std::fs::write(&key, b"KEY-A").unwrap();
        assert!(ensure_repository_key(&verifier, &repo, &key, &mut feedback).await);
        assert!(feedback.last().unwrap().is_info());
        assert_eq!(verifier.installs(), 1);

        assert!(ensure_repository_key(&verifier, &repo, &key, &mut feedback).await);
        assert_eq!(verifier.installs(), 1);

        std::fs::write(&key, b"KEY-B").unwrap();
        assert!(ensure_repository_key(&verifier, &repo, &key, &mut feedback).await);
        assert!(matches!(feedback.last().unwrap(), Feedback::Security(_)));
        assert_eq!(verifier.installs(), 1);
    }
}
