use std::path::{Path, PathBuf};
use std::process::Output;

use entropy_sync::RepositoryId;
use entropy_sync::signature::{SignatureError, SignatureVerifier, Verification};

/// Verifies repository signatures with the `gpg` binary, one keyring
/// directory per repository.
pub struct GnupgVerifier {
    program: String,
    home: PathBuf,
}

impl GnupgVerifier {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            program: "gpg".to_owned(),
            home: home.into(),
        }
    }

    fn keyring(&self, repo: &RepositoryId) -> PathBuf {
        self.home.join(repo.as_str())
    }

    async fn run(&self, homedir: &Path, args: &[&std::ffi::OsStr]) -> Result<Output, SignatureError> {
        tokio::process::Command::new(&self.program)
            .arg("--homedir")
            .arg(homedir)
            .args(["--batch", "--no-tty", "--quiet"])
            .args(args)
            .output()
            .await
            .map_err(|e| SignatureError::Unavailable(format!("cannot run {}: {e}", self.program)))
    }

    async fn ensure_home(path: &Path) -> Result<(), SignatureError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| SignatureError::Failed(format!("{}: {e}", path.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await;
        }
        Ok(())
    }
}

/// First primary-key fingerprint in `--with-colons` output.
pub fn parse_fingerprint(colons: &str) -> Option<String> {
    colons
        .lines()
        .filter(|line| line.starts_with("fpr:"))
        .find_map(|line| line.split(':').nth(9).filter(|f| !f.is_empty()))
        .map(str::to_owned)
}

/// Interpret `--status-fd` output of `gpg --verify`.
pub fn classify_status(status: &str) -> Result<Verification, SignatureError> {
    let mut valid = false;
    for line in status.lines() {
        let Some(rest) = line.strip_prefix("[GNUPG:] ") else {
            continue;
        };
        let mut words = rest.split_whitespace();
        match words.next() {
            Some("VALIDSIG") => valid = true,
            Some("BADSIG") => {
                return Ok(Verification {
                    valid: false,
                    message: format!("bad signature from {}", words.collect::<Vec<_>>().join(" ")),
                });
            }
            Some("EXPKEYSIG") | Some("KEYEXPIRED") => {
                return Err(SignatureError::KeyExpired(rest.to_owned()));
            }
            Some("NO_PUBKEY") => {
                return Err(SignatureError::Unavailable("no public key for signature".into()));
            }
            Some("ERRSIG") => return Err(SignatureError::Failed(rest.to_owned())),
            _ => {}
        }
    }
    Ok(Verification {
        valid,
        message: if valid {
            "good signature".into()
        } else {
            "no valid signature found".into()
        },
    })
}

#[async_trait::async_trait]
impl SignatureVerifier for GnupgVerifier {
    async fn verify(
        &self,
        repo: &RepositoryId,
        payload: &Path,
        signature: &Path,
    ) -> Result<Verification, SignatureError> {
        let home = self.keyring(repo);
        if !home.exists() {
            return Err(SignatureError::Unavailable(format!("no keyring for {repo}")));
        }
        let output = self
            .run(
                &home,
                &[
                    "--status-fd".as_ref(),
                    "1".as_ref(),
                    "--verify".as_ref(),
                    signature.as_os_str(),
                    payload.as_os_str(),
                ],
            )
            .await?;
        classify_status(&String::from_utf8_lossy(&output.stdout))
    }

    async fn install_key(&self, repo: &RepositoryId, key: &Path) -> Result<String, SignatureError> {
        let home = self.keyring(repo);
        Self::ensure_home(&home).await?;
        let output = self.run(&home, &["--import".as_ref(), key.as_os_str()]).await?;
        if !output.status.success() {
            return Err(SignatureError::Failed(format!(
                "key import failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        tracing::info!(repository = %repo, "installed repository key");
        self.installed_fingerprint(repo)
            .await?
            .ok_or_else(|| SignatureError::Failed("imported key not found in keyring".into()))
    }

    async fn installed_fingerprint(
        &self,
        repo: &RepositoryId,
    ) -> Result<Option<String>, SignatureError> {
        let home = self.keyring(repo);
        if !home.exists() {
            return Ok(None);
        }
        let output = self
            .run(&home, &["--with-colons".as_ref(), "--list-keys".as_ref()])
            .await?;
        Ok(parse_fingerprint(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn key_fingerprint(&self, key: &Path) -> Result<String, SignatureError> {
        let scratch = tempfile::tempdir()
            .map_err(|e| SignatureError::Failed(format!("scratch keyring: {e}")))?;
        let output = self
            .run(
                scratch.path(),
                &["--with-colons".as_ref(), "--show-keys".as_ref(), key.as_os_str()],
            )
            .await?;
        parse_fingerprint(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| SignatureError::Failed(format!("{} holds no key", key.display())))
    }
}
