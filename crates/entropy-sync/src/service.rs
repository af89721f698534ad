use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::repository::{RepositoryId, ServiceEndpoint};
use crate::store::{PackageId, PackageRecord, PackageSets, TreeUpdates};

/// Server-assigned differential session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scope of every differential request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryQuery {
    pub repository: RepositoryId,
    pub arch: String,
    pub product: String,
    pub branch: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("cannot connect to {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("service call timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Connects to a repository's differential service.
#[async_trait::async_trait]
pub trait ServiceConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &ServiceEndpoint,
        timeout: Duration,
    ) -> Result<Box<dyn ServiceConnection>, ServiceError>;
}

/// One open connection. Replies are returned raw and classified by the caller,
/// since "locked" and "retry" are signalled in-band.
#[async_trait::async_trait]
pub trait ServiceConnection: Send {
    async fn open_session(&mut self) -> Result<SessionToken, ServiceError>;

    async fn close_session(&mut self, session: &SessionToken) -> Result<(), ServiceError>;

    /// Added/removed identifiers relative to `local_ids`, plus the remote checksum.
    async fn differential_comparison(
        &mut self,
        session: &SessionToken,
        query: &RepositoryQuery,
        local_ids: &BTreeSet<PackageId>,
    ) -> Result<Value, ServiceError>;

    async fn package_records(
        &mut self,
        session: &SessionToken,
        query: &RepositoryQuery,
        ids: &[PackageId],
    ) -> Result<Value, ServiceError>;

    async fn repository_metadata(
        &mut self,
        session: &SessionToken,
        query: &RepositoryQuery,
    ) -> Result<Value, ServiceError>;

    async fn disconnect(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackageDiff {
    pub added: Vec<PackageId>,
    pub removed: Vec<PackageId>,
    pub secure_checksum: String,
}

impl PackageDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Classified reply to `differential_comparison`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffReply {
    Diff(PackageDiff),
    Locked,
    Malformed(String),
}

impl DiffReply {
    /// `false` and an empty checksum both mean the repository is being
    /// rewritten on the server.
    pub fn classify(reply: Value) -> Self {
        let map = match reply {
            Value::Bool(false) => return Self::Locked,
            Value::Object(map) => map,
            other => return Self::Malformed(format!("unexpected diff reply: {other}")),
        };
        let ids = |key: &str| -> Result<Vec<PackageId>, String> {
            let value = map.get(key).ok_or_else(|| format!("missing `{key}`"))?;
            serde_json::from_value(value.clone()).map_err(|e| format!("bad `{key}`: {e}"))
        };
        let added = match ids("added") {
            Ok(v) => v,
            Err(e) => return Self::Malformed(e),
        };
        let removed = match ids("removed") {
            Ok(v) => v,
            Err(e) => return Self::Malformed(e),
        };
        let secure_checksum = match map.get("secure_checksum") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) => String::new(),
            Some(other) => return Self::Malformed(format!("bad `secure_checksum`: {other}")),
            None => return Self::Malformed("missing `secure_checksum`".into()),
        };
        if secure_checksum.is_empty() {
            return Self::Locked;
        }
        Self::Diff(PackageDiff {
            added,
            removed,
            secure_checksum,
        })
    }
}

/// Classified reply to `package_records`.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordsReply {
    Records(Vec<PackageRecord>),
    /// `null`: the server had nothing ready, ask again.
    Retry,
    Locked,
    /// `[code, message]`
    Error { code: i64, message: String },
    Malformed(String),
}

impl RecordsReply {
    pub fn classify(reply: Value) -> Self {
        match reply {
            Value::Null => Self::Retry,
            Value::Bool(false) => Self::Locked,
            Value::Array(items)
                if items.len() == 2 && items[0].is_i64() && items[1].is_string() =>
            {
                Self::Error {
                    code: items[0].as_i64().unwrap_or_default(),
                    message: items[1].as_str().unwrap_or_default().to_string(),
                }
            }
            Value::Object(map) => {
                let mut records = Vec::with_capacity(map.len());
                for (key, value) in map {
                    let mut record: PackageRecord = match serde_json::from_value(value) {
                        Ok(r) => r,
                        Err(e) => return Self::Malformed(format!("bad record {key}: {e}")),
                    };
                    match key.parse::<PackageId>() {
                        Ok(id) => record.id = id,
                        Err(_) => return Self::Malformed(format!("bad record key {key}")),
                    }
                    records.push(record);
                }
                Self::Records(records)
            }
            other => Self::Malformed(format!("unexpected records reply: {other}")),
        }
    }
}

/// Repository-wide auxiliary metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RepositoryMetadata {
    pub sets: PackageSets,
    pub tree_updates: TreeUpdates,
    pub library_ids: BTreeSet<PackageId>,
}

impl RepositoryMetadata {
    pub const KEYS: [&'static str; 4] = [
        "sets",
        "treeupdates_actions",
        "treeupdates_digest",
        "library_idpackages",
    ];

    /// Every key in `KEYS` must be present.
    pub fn from_reply(reply: Value) -> Result<Self, String> {
        let Value::Object(map) = reply else {
            return Err(format!("unexpected metadata reply: {reply}"));
        };
        if let Some(missing) = Self::KEYS.iter().find(|k| !map.contains_key(**k)) {
            return Err(format!("missing `{missing}`"));
        }
        let field = |key: &str| map.get(key).cloned().unwrap_or(Value::Null);

        let sets: BTreeMap<String, BTreeSet<String>> =
            serde_json::from_value(field("sets")).map_err(|e| format!("bad `sets`: {e}"))?;
        let actions: Vec<String> = serde_json::from_value(field("treeupdates_actions"))
            .map_err(|e| format!("bad `treeupdates_actions`: {e}"))?;
        let digest: String = serde_json::from_value(field("treeupdates_digest"))
            .map_err(|e| format!("bad `treeupdates_digest`: {e}"))?;
        let library_ids: BTreeSet<PackageId> = serde_json::from_value(field("library_idpackages"))
            .map_err(|e| format!("bad `library_idpackages`: {e}"))?;

        Ok(Self {
            sets,
            tree_updates: TreeUpdates { digest, actions },
            library_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn diff_reply_variants() {
        assert_eq!(DiffReply::classify(json!(false)), DiffReply::Locked);
        assert_eq!(
            DiffReply::classify(json!({"added": [1], "removed": [], "secure_checksum": ""})),
            DiffReply::Locked
        );
        assert!(matches!(
            DiffReply::classify(json!("garbage")),
            DiffReply::Malformed(_)
        ));
        assert!(matches!(
            DiffReply::classify(json!({"added": [1], "secure_checksum": "x"})),
            DiffReply::Malformed(_)
        ));
        assert!(matches!(
            DiffReply::classify(json!({"added": ["a"], "removed": [], "secure_checksum": "x"})),
            DiffReply::Malformed(_)
        ));
        assert_eq!(
            DiffReply::classify(json!({"added": [101, 102], "removed": [50], "secure_checksum": "abc"})),
            DiffReply::Diff(PackageDiff {
                added: vec![101, 102],
                removed: vec![50],
                secure_checksum: "abc".into(),
            })
        );
    }

    #[test]
    fn records_reply_variants() {
        assert_eq!(RecordsReply::classify(json!(null)), RecordsReply::Retry);
        assert_eq!(RecordsReply::classify(json!(false)), RecordsReply::Locked);
        assert_eq!(
            RecordsReply::classify(json!([500, "boom"])),
            RecordsReply::Error {
                code: 500,
                message: "boom".into()
            }
        );
        let RecordsReply::Records(records) = RecordsReply::classify(json!({
            "101": {"id": 0, "atom": "app-misc/foo-1.0", "revision": 1}
        })) else {
            panic!("expected records");
        };
        assert_eq!(records[0].id, 101);
        assert!(matches!(
            RecordsReply::classify(json!({"x": {"atom": "a"}})),
            RecordsReply::Malformed(_)
        ));
        assert!(matches!(
            RecordsReply::classify(json!(12)),
            RecordsReply::Malformed(_)
        ));
    }

    #[test]
    fn metadata_requires_every_key() {
        let full = json!({
            "sets": {"@system": ["sys-apps/entropy"]},
            "treeupdates_actions": ["move app-misc/a app-misc/b"],
            "treeupdates_digest": "d1",
            "library_idpackages": [3, 1],
        });
        let meta = RepositoryMetadata::from_reply(full.clone()).unwrap();
        assert_eq!(meta.tree_updates.digest, "d1");
        assert_eq!(meta.library_ids.iter().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert!(meta.sets["@system"].contains("sys-apps/entropy"));

        for key in RepositoryMetadata::KEYS {
            let mut partial = full.clone();
            partial.as_object_mut().unwrap().remove(key);
            let err = RepositoryMetadata::from_reply(partial).unwrap_err();
            assert!(err.contains(key), "{err}");
        }
    }
}
