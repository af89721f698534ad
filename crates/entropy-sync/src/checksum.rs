use std::io::Read;
use std::path::Path;

use md5::{Digest, Md5};

use crate::error::SyncError;
use crate::store::{ChecksumOptions, PackageRecord};

/// Hex md5 of a file's contents.
pub fn file_md5(path: &Path) -> Result<String, SyncError> {
    let mut file = std::fs::File::open(path).map_err(|e| SyncError::local(path, e))?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| SyncError::local(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest from a checksum manifest: the first token of the first non-empty
/// line, as written by `md5sum`.
pub fn parse_manifest(text: &str) -> Option<String> {
    let token = text.lines().find(|l| !l.trim().is_empty())?.split_whitespace().next()?;
    let valid = token.len() == 32 && token.chars().all(|c| c.is_ascii_hexdigit());
    valid.then(|| token.to_ascii_lowercase())
}

/// Whether `payload` matches the digest in `manifest`.
pub fn verify_against_manifest(payload: &Path, manifest: &Path) -> Result<bool, SyncError> {
    let text = std::fs::read_to_string(manifest).map_err(|e| SyncError::local(manifest, e))?;
    let expected = parse_manifest(&text).ok_or_else(|| {
        SyncError::Integrity(format!("malformed checksum manifest {}", manifest.display()))
    })?;
    let actual = file_md5(payload)?;
    if actual != expected {
        tracing::warn!(
            payload = %payload.display(),
            expected = %expected,
            actual = %actual,
            "checksum mismatch"
        );
    }
    Ok(actual == expected)
}

/// Digest over a repository's package set.
///
/// Both sides of the differential protocol compute it the same way: one line
/// per package, `id|atom|revision` plus `|signature` when signatures are
/// included, ordered by id when requested.
pub fn repository_digest<'a>(
    records: impl IntoIterator<Item = &'a PackageRecord>,
    options: ChecksumOptions,
) -> String {
    let mut rows: Vec<&PackageRecord> = records.into_iter().collect();
    if options.ordered {
        rows.sort_by_key(|r| r.id);
    }
    let mut hasher = Md5::new();
    for record in rows {
        hasher.update(format!("{}|{}|{}", record.id, record.atom, record.revision));
        if options.include_signatures {
            hasher.update(b"|");
            hasher.update(record.signature.as_deref().unwrap_or_default());
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_parsing() {
        let digest = "d41d8cd98f00b204e9800998ecf8427e";
        assert_eq!(
            parse_manifest(&format!("{digest}  packages.db.light.bz2\n")).as_deref(),
            Some(digest)
        );
        assert_eq!(
            parse_manifest(&format!("\n{}\n", digest.to_uppercase())).as_deref(),
            Some(digest)
        );
        assert_eq!(parse_manifest("nonsense packages.db"), None);
        assert_eq!(parse_manifest(""), None);
    }

    #[test]
    fn verification_flips_on_single_byte_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("packages.db.light.bz2");
        let manifest = dir.path().join("packages.db.light.bz2.md5");
        std::fs::write(&payload, b"repository payload").unwrap();
        let digest = file_md5(&payload).unwrap();
        std::fs::write(&manifest, format!("{digest}  packages.db.light.bz2\n")).unwrap();
        assert!(verify_against_manifest(&payload, &manifest).unwrap());

        std::fs::write(&payload, b"repository paylaod").unwrap();
        assert!(!verify_against_manifest(&payload, &manifest).unwrap());
    }

    #[test]
    fn malformed_manifest_is_an_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("p");
        let manifest = dir.path().join("p.md5");
        std::fs::write(&payload, b"x").unwrap();
        std::fs::write(&manifest, b"<html>404</html>").unwrap();
        assert!(matches!(
            verify_against_manifest(&payload, &manifest),
            Err(SyncError::Integrity(_))
        ));
    }

    #[test]
    fn known_md5() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(file_md5(&path).unwrap(), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn repository_digest_ignores_input_order_when_ordered() {
        let a = PackageRecord::new(1, "app-misc/foo-1.0", 0);
        let b = PackageRecord::new(2, "app-misc/bar-2.0", 1).with_signature("abc");
        let options = ChecksumOptions::default();
        assert_eq!(
            repository_digest([&a, &b], options),
            repository_digest([&b, &a], options)
        );
        let unsigned = ChecksumOptions {
            include_signatures: false,
            ..options
        };
        assert_ne!(
            repository_digest([&a, &b], options),
            repository_digest([&a, &b], unsigned)
        );
    }
}
