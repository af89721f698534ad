use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use entropy_sync::checksum::repository_digest;
use entropy_sync::store::{
    Annotation, ChecksumOptions, MetadataStore, PackageId, PackageRecord, PackageSets, StoreError,
    StoreOpener, TreeUpdates,
};
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};

use crate::schema;

type RawRecord = (PackageId, String, i64, Option<String>, String);

const RECORD_COLUMNS: &str = "idpackage, atom, revision, signature, fields_json";

/// A repository's SQLite metadata database.
pub struct RepositoryStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl RepositoryStore {
    /// Open (or create) the database at `path` and bring its schema up to date.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(db_error)?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(db_error)?;
        Self::init(conn, None)
    }

    fn init(mut conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        // SQLite only looks at the file on first use.
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
            .map_err(db_error)?;
        schema::migrations()
            .to_latest(&mut conn)
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn package_count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT count(*) FROM packages", [], |row| row.get(0))
            .map_err(db_error)?;
        Ok(count.max(0) as usize)
    }

    fn all_records(conn: &Connection) -> Result<Vec<PackageRecord>, StoreError> {
        let mut stmt = conn
            .prepare(&format!("SELECT {RECORD_COLUMNS} FROM packages ORDER BY idpackage"))
            .map_err(db_error)?;
        let raw = stmt
            .query_map([], raw_record)
            .map_err(db_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error)?;
        raw.into_iter().map(into_record).collect()
    }
}

fn raw_record(row: &rusqlite::Row) -> rusqlite::Result<RawRecord> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_record((id, atom, revision, signature, fields_json): RawRecord) -> Result<PackageRecord, StoreError> {
    let fields = serde_json::from_str(&fields_json)
        .map_err(|e| StoreError::Corrupt(format!("package {id}: {e}")))?;
    Ok(PackageRecord {
        id,
        atom,
        revision,
        signature,
        fields,
    })
}

fn db_error(e: rusqlite::Error) -> StoreError {
    match e.sqlite_error_code() {
        Some(ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt) => {
            StoreError::Corrupt(e.to_string())
        }
        _ => StoreError::Database(e.to_string()),
    }
}

impl MetadataStore for RepositoryStore {
    fn list_all_identifiers(&self) -> Result<BTreeSet<PackageId>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT idpackage FROM packages")
            .map_err(db_error)?;
        let ids = stmt
            .query_map([], |row| row.get(0))
            .map_err(db_error)?
            .collect::<Result<BTreeSet<PackageId>, _>>()
            .map_err(db_error)?;
        Ok(ids)
    }

    fn record(&self, id: PackageId) -> Result<Option<PackageRecord>, StoreError> {
        let raw = self
            .conn
            .lock()
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM packages WHERE idpackage = ?1"),
                [id],
                raw_record,
            )
            .optional()
            .map_err(db_error)?;
        raw.map(into_record).transpose()
    }

    fn find_atoms(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT atom FROM packages
                 WHERE substr(atom, 1, length(?1)) = ?1
                 ORDER BY atom",
            )
            .map_err(db_error)?;
        let atoms = stmt
            .query_map([prefix], |row| row.get(0))
            .map_err(db_error)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(db_error)?;
        Ok(atoms)
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        let conn = self.conn.get_mut();
        if conn.is_autocommit() {
            conn.execute_batch("BEGIN IMMEDIATE").map_err(db_error)?;
        }
        Ok(())
    }

    fn insert_record(&mut self, record: &PackageRecord) -> Result<(), StoreError> {
        let fields = serde_json::to_string(&record.fields)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        self.conn
            .get_mut()
            .execute(
                "INSERT OR REPLACE INTO packages
                    (idpackage, atom, revision, signature, fields_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![record.id, record.atom, record.revision, record.signature, fields],
            )
            .map_err(db_error)?;
        Ok(())
    }

    fn remove_record(&mut self, id: PackageId) -> Result<(), StoreError> {
        let removed = self
            .conn
            .get_mut()
            .execute("DELETE FROM packages WHERE idpackage = ?1", [id])
            .map_err(db_error)?;
        if removed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    fn package_sets(&self) -> Result<PackageSets, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT setname, dependency FROM package_sets")
            .map_err(db_error)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(db_error)?;
        let mut sets = PackageSets::new();
        for row in rows {
            let (name, dependency) = row.map_err(db_error)?;
            sets.entry(name).or_default().insert(dependency);
        }
        Ok(sets)
    }

    fn replace_package_sets(&mut self, sets: &PackageSets) -> Result<(), StoreError> {
        let conn = self.conn.get_mut();
        conn.execute("DELETE FROM package_sets", []).map_err(db_error)?;
        let mut stmt = conn
            .prepare("INSERT INTO package_sets (setname, dependency) VALUES (?1, ?2)")
            .map_err(db_error)?;
        for (name, members) in sets {
            for dependency in members {
                stmt.execute(params![name, dependency]).map_err(db_error)?;
            }
        }
        Ok(())
    }

    fn tree_updates(&self) -> Result<Option<TreeUpdates>, StoreError> {
        let conn = self.conn.lock();
        let digest: Option<String> = conn
            .query_row("SELECT digest FROM treeupdates WHERE id = 0", [], |row| row.get(0))
            .optional()
            .map_err(db_error)?;
        let Some(digest) = digest else {
            return Ok(None);
        };
        let mut stmt = conn
            .prepare("SELECT command FROM treeupdates_actions ORDER BY seq")
            .map_err(db_error)?;
        let actions = stmt
            .query_map([], |row| row.get(0))
            .map_err(db_error)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(db_error)?;
        Ok(Some(TreeUpdates { digest, actions }))
    }

    fn set_tree_updates(&mut self, updates: &TreeUpdates) -> Result<(), StoreError> {
        let conn = self.conn.get_mut();
        conn.execute(
            "INSERT OR REPLACE INTO treeupdates (id, digest) VALUES (0, ?1)",
            [&updates.digest],
        )
        .map_err(db_error)?;
        conn.execute("DELETE FROM treeupdates_actions", [])
            .map_err(db_error)?;
        let mut stmt = conn
            .prepare("INSERT INTO treeupdates_actions (seq, command) VALUES (?1, ?2)")
            .map_err(db_error)?;
        for (seq, command) in updates.actions.iter().enumerate() {
            stmt.execute(params![seq as i64, command]).map_err(db_error)?;
        }
        Ok(())
    }

    fn setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.conn
            .lock()
            .query_row(
                "SELECT setting_value FROM settings WHERE setting_name = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_error)
    }

    fn set_setting(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn
            .get_mut()
            .execute(
                "INSERT OR REPLACE INTO settings (setting_name, setting_value) VALUES (?1, ?2)",
                [key, value],
            )
            .map_err(db_error)?;
        Ok(())
    }

    fn annotations(&self) -> Result<Vec<Annotation>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT atom, key, value FROM annotations ORDER BY atom, key")
            .map_err(db_error)?;
        let annotations = stmt
            .query_map([], |row| {
                Ok(Annotation {
                    atom: row.get(0)?,
                    key: row.get(1)?,
                    value: row.get(2)?,
                })
            })
            .map_err(db_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error)?;
        Ok(annotations)
    }

    fn set_annotation(&mut self, annotation: &Annotation) -> Result<(), StoreError> {
        self.conn
            .get_mut()
            .execute(
                "INSERT OR REPLACE INTO annotations (atom, key, value) VALUES (?1, ?2, ?3)",
                [&annotation.atom, &annotation.key, &annotation.value],
            )
            .map_err(db_error)?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let conn = self.conn.get_mut();
        if !conn.is_autocommit() {
            conn.execute_batch("COMMIT").map_err(db_error)?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        let conn = self.conn.get_mut();
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK").map_err(db_error)?;
        }
        Ok(())
    }

    fn checksum(&self, options: ChecksumOptions) -> Result<String, StoreError> {
        let records = Self::all_records(&self.conn.lock())?;
        Ok(repository_digest(&records, options))
    }

    fn rebuild_indexes(&mut self) -> Result<(), StoreError> {
        self.conn
            .get_mut()
            .execute_batch("REINDEX; ANALYZE;")
            .map_err(db_error)
    }

    fn close(self: Box<Self>) -> Result<(), StoreError> {
        self.conn.into_inner().close().map_err(|(_, e)| db_error(e))
    }
}

/// Opens `RepositoryStore`s and loads SQL text dumps into fresh databases.
#[derive(Debug, Clone, Copy, Default)]
pub struct RepositoryStoreOpener;

impl RepositoryStoreOpener {
    fn load_dump(sql: &str, dest: &Path) -> Result<(), StoreError> {
        let conn = Connection::open(dest).map_err(db_error)?;
        conn.execute_batch(sql)
            .map_err(|e| StoreError::Corrupt(format!("dump does not load: {e}")))?;
        conn.close().map_err(|(_, e)| db_error(e))?;
        Box::new(RepositoryStore::open(dest)?).close()
    }
}

impl StoreOpener for RepositoryStoreOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn MetadataStore>, StoreError> {
        Ok(Box::new(RepositoryStore::open(path)?))
    }

    fn import_dump(&self, dump: &Path, dest: &Path) -> Result<(), StoreError> {
        let sql = std::fs::read_to_string(dump).map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidData => StoreError::Corrupt(format!("dump is not text: {e}")),
            _ => StoreError::Io(e.to_string()),
        })?;
        match std::fs::remove_file(dest) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Io(e.to_string())),
        }

        let result = Self::load_dump(&sql, dest);
        if let Err(e) = &result {
            tracing::debug!(dest = %dest.display(), "dump import failed: {e}");
            let _ = std::fs::remove_file(dest);
        }
        result
    }
}
