use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tier::ProtocolTier;

/// Local metadata store file name.
pub const DATABASE_FILE: &str = "packages.db";
/// Single-integer text file holding the last synced revision.
pub const REVISION_FILE: &str = "packages.db.revision";
/// Uncompressed tier-2 dump, transient.
pub const DUMP_FILE: &str = "packages.db.dumplight";
/// Lists repository files that no longer exist upstream; shipped in the meta bundle.
pub const META_NOT_FOUND_FILE: &str = "packages.db.meta_notfound";
pub const POST_UPDATE_HOOK: &str = "packages.db.post_update.sh";
/// Repository public key, shipped in the meta bundle.
pub const PUBLIC_KEY_FILE: &str = "signature.asc";
pub const SIGNATURE_EXTENSION: &str = ".asc";
pub const CHECKSUM_EXTENSION: &str = ".md5";

/// Compression codec a repository publishes its databases with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CompressionFormat {
    #[default]
    #[serde(rename = "bz2")]
    Bzip2,
    #[serde(rename = "gz")]
    Gzip,
}

impl CompressionFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Bzip2 => "bz2",
            Self::Gzip => "gz",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "bz2" | "bzip2" => Some(Self::Bzip2),
            "gz" | "gzip" => Some(Self::Gzip),
            _ => None,
        }
    }
}

impl fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Every item a mirror publishes for a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// Full database (developer mode).
    Db,
    DbChecksum,
    /// Database without file-content tables.
    DbLight,
    DbLightChecksum,
    /// SQL dump of the light database.
    DumpLight,
    DumpLightChecksum,
    Revision,
    /// Present while the repository is being rewritten upstream.
    DownloadLock,
    /// Present while the differential service is rebuilding.
    ServiceLock,
    NoticeBoard,
    /// Tarball of auxiliary repository files.
    MetaBundle,
    MetaBundleSignature,
}

struct PayloadSpec {
    stem: &'static str,
    suffix: &'static str,
    compressed: bool,
}

impl PayloadKind {
    const fn spec(self) -> PayloadSpec {
        match self {
            Self::Db => PayloadSpec {
                stem: "packages.db",
                suffix: "",
                compressed: true,
            },
            Self::DbChecksum => PayloadSpec {
                stem: "packages.db",
                suffix: CHECKSUM_EXTENSION,
                compressed: true,
            },
            Self::DbLight => PayloadSpec {
                stem: "packages.db.light",
                suffix: "",
                compressed: true,
            },
            Self::DbLightChecksum => PayloadSpec {
                stem: "packages.db.light",
                suffix: CHECKSUM_EXTENSION,
                compressed: true,
            },
            Self::DumpLight => PayloadSpec {
                stem: "packages.db.dumplight",
                suffix: "",
                compressed: true,
            },
            Self::DumpLightChecksum => PayloadSpec {
                stem: "packages.db.dumplight",
                suffix: CHECKSUM_EXTENSION,
                compressed: true,
            },
            Self::Revision => PayloadSpec {
                stem: REVISION_FILE,
                suffix: "",
                compressed: false,
            },
            Self::DownloadLock => PayloadSpec {
                stem: "packages.db.download.lock",
                suffix: "",
                compressed: false,
            },
            Self::ServiceLock => PayloadSpec {
                stem: "packages.db.eapi3_lock",
                suffix: "",
                compressed: false,
            },
            Self::NoticeBoard => PayloadSpec {
                stem: "notice.rss",
                suffix: "",
                compressed: false,
            },
            Self::MetaBundle => PayloadSpec {
                stem: "packages.db.meta",
                suffix: "",
                compressed: false,
            },
            Self::MetaBundleSignature => PayloadSpec {
                stem: "packages.db.meta",
                suffix: SIGNATURE_EXTENSION,
                compressed: false,
            },
        }
    }

    /// Whether the file name depends on the repository's compression format.
    pub fn requires_compression(self) -> bool {
        self.spec().compressed
    }

    /// File name on the mirror. Local copies use the same name.
    pub fn file_name(self, compression: CompressionFormat) -> String {
        let spec = self.spec();
        if spec.compressed {
            format!("{}.{}{}", spec.stem, compression.extension(), spec.suffix)
        } else {
            format!("{}{}", spec.stem, spec.suffix)
        }
    }

    /// The checksum manifest published next to a database payload.
    pub fn checksum_companion(self) -> Option<Self> {
        match self {
            Self::Db => Some(Self::DbChecksum),
            Self::DbLight => Some(Self::DbLightChecksum),
            Self::DumpLight => Some(Self::DumpLightChecksum),
            _ => None,
        }
    }

    /// The database payload a bulk tier downloads. `None` for the differential tier.
    pub fn primary_for(tier: ProtocolTier, developer_mode: bool) -> Option<Self> {
        match tier {
            ProtocolTier::Differential => None,
            ProtocolTier::CompressedDump => Some(Self::DumpLight),
            ProtocolTier::LightDatabase if developer_mode => Some(Self::Db),
            ProtocolTier::LightDatabase => Some(Self::DbLight),
        }
    }
}

/// Detached signature file name for a payload file name.
pub fn signature_name(file_name: &str) -> String {
    format!("{file_name}{SIGNATURE_EXTENSION}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_names_follow_mirror_layout() {
        let bz2 = CompressionFormat::Bzip2;
        let gz = CompressionFormat::Gzip;
        assert_eq!(PayloadKind::Db.file_name(bz2), "packages.db.bz2");
        assert_eq!(PayloadKind::DbChecksum.file_name(gz), "packages.db.gz.md5");
        assert_eq!(PayloadKind::DbLight.file_name(bz2), "packages.db.light.bz2");
        assert_eq!(
            PayloadKind::DbLightChecksum.file_name(bz2),
            "packages.db.light.bz2.md5"
        );
        assert_eq!(
            PayloadKind::DumpLight.file_name(gz),
            "packages.db.dumplight.gz"
        );
        assert_eq!(
            PayloadKind::DumpLightChecksum.file_name(bz2),
            "packages.db.dumplight.bz2.md5"
        );
    }

    #[test]
    fn plain_names_ignore_compression() {
        for format in [CompressionFormat::Bzip2, CompressionFormat::Gzip] {
            assert_eq!(PayloadKind::Revision.file_name(format), "packages.db.revision");
            assert_eq!(
                PayloadKind::DownloadLock.file_name(format),
                "packages.db.download.lock"
            );
            assert_eq!(
                PayloadKind::ServiceLock.file_name(format),
                "packages.db.eapi3_lock"
            );
            assert_eq!(PayloadKind::NoticeBoard.file_name(format), "notice.rss");
            assert_eq!(PayloadKind::MetaBundle.file_name(format), "packages.db.meta");
            assert_eq!(
                PayloadKind::MetaBundleSignature.file_name(format),
                "packages.db.meta.asc"
            );
        }
    }

    #[test]
    fn tier_maps_to_primary_payload() {
        assert_eq!(PayloadKind::primary_for(ProtocolTier::Differential, false), None);
        assert_eq!(
            PayloadKind::primary_for(ProtocolTier::CompressedDump, true),
            Some(PayloadKind::DumpLight)
        );
        assert_eq!(
            PayloadKind::primary_for(ProtocolTier::LightDatabase, false),
            Some(PayloadKind::DbLight)
        );
        assert_eq!(
            PayloadKind::primary_for(ProtocolTier::LightDatabase, true),
            Some(PayloadKind::Db)
        );
    }

    #[test]
    fn every_primary_has_a_checksum() {
        for kind in [PayloadKind::Db, PayloadKind::DbLight, PayloadKind::DumpLight] {
            let ck = kind.checksum_companion().unwrap();
            assert!(ck.requires_compression());
            assert!(ck.file_name(CompressionFormat::Bzip2).ends_with(".md5"));
        }
        assert_eq!(PayloadKind::Revision.checksum_companion(), None);
    }

    #[test]
    fn parse_compression() {
        assert_eq!(CompressionFormat::parse("bz2"), Some(CompressionFormat::Bzip2));
        assert_eq!(CompressionFormat::parse(" GZ "), Some(CompressionFormat::Gzip));
        assert_eq!(CompressionFormat::parse("xz"), None);
        assert_eq!(signature_name("packages.db.meta"), "packages.db.meta.asc");
    }
}
