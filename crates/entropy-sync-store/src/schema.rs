use rusqlite_migration::{M, Migrations};

/// Tables are created only if missing so that databases built from a
/// remote dump, which carry the schema but no migration version, can be
/// brought under migration control.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "CREATE TABLE IF NOT EXISTS packages (
                idpackage       INTEGER PRIMARY KEY,
                atom            TEXT NOT NULL,
                revision        INTEGER NOT NULL DEFAULT 0,
                signature       TEXT,
                fields_json     TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS package_sets (
                setname         TEXT NOT NULL,
                dependency      TEXT NOT NULL,
                PRIMARY KEY (setname, dependency)
            );

            CREATE TABLE IF NOT EXISTS treeupdates (
                id              INTEGER PRIMARY KEY CHECK (id = 0),
                digest          TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS treeupdates_actions (
                seq             INTEGER PRIMARY KEY,
                command         TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings (
                setting_name    TEXT PRIMARY KEY,
                setting_value   TEXT NOT NULL
            );",
        ),
        M::up(
            "CREATE TABLE IF NOT EXISTS annotations (
                atom            TEXT NOT NULL,
                key             TEXT NOT NULL,
                value           TEXT NOT NULL,
                PRIMARY KEY (atom, key)
            );

            CREATE INDEX IF NOT EXISTS idx_packages_atom ON packages(atom);",
        ),
    ])
}
