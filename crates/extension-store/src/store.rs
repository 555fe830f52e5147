//! SQLite-backed extension store for one namespace.
//!
//! # Schema
//! - `metadata`: one row per installed extension, keyed by versioned-id.
//! - `extensions`: archive bytes plus an info JSON snapshot, same key.
//!
//! # Versioning
//! `PRAGMA user_version` tracks the schema. Version 1 keyed rows by
//! base-id; version 2 keys by versioned-id and adds `marketplace_id`. The
//! v1 -> v2 migration runs inside the upgrade transaction, skips rows
//! already in v2 form, logs and skips rows that fail, and never blocks
//! open.
//!
//! SQLite settings applied at open: WAL, synchronous=FULL, foreign_keys=ON,
//! plus an integrity check.

use std::path::Path;

use rusqlite::{Connection, params};
use tracing::{info, warn};

use crate::ids::{extract_base_id, to_versioned_id};
use crate::manifest::FoxePackage;
use crate::{ExtensionInfo, StoreError};

const SCHEMA_VERSION: i64 = 2;

pub struct ExtensionStore {
    conn: Connection,
    namespace: String,
}

impl ExtensionStore {
    /// Open (or create) the store at `path`, migrating old schemas.
    pub fn open(path: &Path, namespace: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        setup(&conn)?;
        Ok(ExtensionStore {
            conn,
            namespace: namespace.to_owned(),
        })
    }

    pub fn open_in_memory(namespace: &str) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        setup(&conn)?;
        Ok(ExtensionStore {
            conn,
            namespace: namespace.to_owned(),
        })
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Store a parsed package. Re-installing an existing versioned-id
    /// overwrites it. Metadata and content rows commit together.
    pub fn install(
        &mut self,
        package: &FoxePackage,
        content: &[u8],
    ) -> Result<ExtensionInfo, StoreError> {
        let base_id = package.base_id();
        let id = to_versioned_id(&base_id, &package.manifest.version);
        crate::ids::validate(&id)?;

        let info = ExtensionInfo {
            id: id.clone(),
            marketplace_id: base_id,
            name: package.manifest.name.clone(),
            publisher: package.manifest.publisher.clone(),
            version: package.manifest.version.clone(),
            display_name: package.manifest.display_name.clone(),
            description: package.manifest.description.clone(),
            qualified_name: package.qualified_name(),
            readme: package.readme.clone(),
            changelog: package.changelog.clone(),
            namespace: self.namespace.clone(),
        };
        let info_json = serde_json::to_string(&info)
            .map_err(|e| StoreError::Parse(format!("serializing extension info: {e}")))?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO metadata
                 (id, marketplace_id, name, publisher, version, display_name,
                  description, qualified_name, readme, changelog, namespace)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                info.id,
                info.marketplace_id,
                info.name,
                info.publisher,
                info.version,
                info.display_name,
                info.description,
                info.qualified_name,
                info.readme,
                info.changelog,
                info.namespace,
            ],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO extensions (id, content, info) VALUES (?1, ?2, ?3)",
            params![info.id, content, info_json],
        )?;
        tx.commit()?;
        info!(id = %info.id, namespace = %self.namespace, "extension installed");
        Ok(info)
    }

    /// Delete both rows. Returns false when nothing was installed.
    pub fn uninstall(&mut self, versioned_id: &str) -> Result<bool, StoreError> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute("DELETE FROM metadata WHERE id = ?1", params![versioned_id])?;
        tx.execute("DELETE FROM extensions WHERE id = ?1", params![versioned_id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    pub fn list(&self) -> Result<Vec<ExtensionInfo>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, marketplace_id, name, publisher, version, display_name,
                    description, qualified_name, readme, changelog, namespace
             FROM metadata ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], map_info)?;
        let mut infos = Vec::new();
        for row in rows {
            infos.push(row?);
        }
        Ok(infos)
    }

    pub fn get(&self, versioned_id: &str) -> Result<Option<ExtensionInfo>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, marketplace_id, name, publisher, version, display_name,
                    description, qualified_name, readme, changelog, namespace
             FROM metadata WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![versioned_id], map_info)?;
        rows.next().transpose().map_err(StoreError::from)
    }

    pub fn load_extension(&self, versioned_id: &str) -> Result<Vec<u8>, StoreError> {
        let content: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT content FROM extensions WHERE id = ?1",
                params![versioned_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        content.ok_or_else(|| StoreError::NotInstalled(versioned_id.to_owned()))
    }

    /// Exact versioned-id match only.
    pub fn is_installed(&self, versioned_id: &str) -> Result<bool, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM metadata WHERE id = ?1",
            params![versioned_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// True iff any installed row's base-id matches.
    pub fn is_any_version_installed(&self, base_id: &str) -> Result<bool, StoreError> {
        let mut stmt = self.conn.prepare("SELECT id FROM metadata")?;
        let ids = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for id in ids {
            if extract_base_id(&id?) == base_id {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn map_info(row: &rusqlite::Row<'_>) -> Result<ExtensionInfo, rusqlite::Error> {
    Ok(ExtensionInfo {
        id: row.get(0)?,
        marketplace_id: row.get(1)?,
        name: row.get(2)?,
        publisher: row.get(3)?,
        version: row.get(4)?,
        display_name: row.get(5)?,
        description: row.get(6)?,
        qualified_name: row.get(7)?,
        readme: row.get(8)?,
        changelog: row.get(9)?,
        namespace: row.get(10)?,
    })
}

// ---------------------------------------------------------------------------
// Schema setup and migration
// ---------------------------------------------------------------------------

fn setup(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA foreign_keys=ON;",
    )?;
    let integrity: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if integrity != "ok" {
        return Err(StoreError::Corrupt(integrity));
    }

    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    match version {
        0 => {
            create_tables(conn)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }
        1 => migrate_v1_to_v2(conn)?,
        SCHEMA_VERSION => create_tables(conn)?,
        newer => {
            return Err(StoreError::Storage(format!(
                "extension store schema version {newer} is newer than supported {SCHEMA_VERSION}"
            )));
        }
    }
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS metadata (
             id             TEXT PRIMARY KEY,
             marketplace_id TEXT NOT NULL,
             name           TEXT NOT NULL,
             publisher      TEXT NOT NULL,
             version        TEXT NOT NULL,
             display_name   TEXT,
             description    TEXT,
             qualified_name TEXT NOT NULL,
             readme         TEXT,
             changelog      TEXT,
             namespace      TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS extensions (
             id      TEXT PRIMARY KEY,
             content BLOB NOT NULL,
             info    TEXT NOT NULL
         );",
    )?;
    Ok(())
}

/// Rewrite v1 base-id keys to `base@version`, set `marketplace_id`, and bump
/// the schema version, all in one transaction. Rows already carrying `@`
/// are left alone so re-running on a v2-shaped store changes nothing.
fn migrate_v1_to_v2(conn: &Connection) -> Result<(), StoreError> {
    info!("migrating extension store schema v1 -> v2");
    conn.execute_batch("BEGIN")?;

    // v1 has no marketplace_id column.
    if let Err(e) = conn.execute("ALTER TABLE metadata ADD COLUMN marketplace_id TEXT", []) {
        warn!(error = %e, "marketplace_id column already present or not addable");
    }

    let rows: Vec<(String, String)> = {
        let mut stmt = match conn.prepare("SELECT id, version FROM metadata") {
            Ok(stmt) => stmt,
            Err(e) => {
                warn!(error = %e, "cannot enumerate v1 metadata; skipping row migration");
                conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
                conn.execute_batch("COMMIT")?;
                create_tables(conn)?;
                return Ok(());
            }
        };
        match stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?))) {
            Ok(mapped) => mapped.filter_map(|r| r.ok()).collect(),
            Err(e) => {
                warn!(error = %e, "cannot read v1 metadata rows; skipping row migration");
                Vec::new()
            }
        }
    };

    for (old_id, version) in rows {
        if old_id.contains('@') {
            continue;
        }
        let new_id = to_versioned_id(&old_id, &version);
        let result = conn.execute(
            "UPDATE metadata SET id = ?1, marketplace_id = ?2 WHERE id = ?3",
            params![new_id, old_id, old_id],
        );
        if let Err(e) = result {
            warn!(id = %old_id, error = %e, "skipping metadata row during migration");
            continue;
        }
        if let Err(e) = migrate_content_row(conn, &old_id, &new_id) {
            warn!(id = %old_id, error = %e, "skipping content row during migration");
        }
    }

    // Backfill marketplace_id for rows that were already versioned.
    let _ = conn.execute(
        "UPDATE metadata
         SET marketplace_id = substr(id, 1, instr(id, '@') - 1)
         WHERE marketplace_id IS NULL AND instr(id, '@') > 0",
        [],
    );

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    conn.execute_batch("COMMIT")?;
    create_tables(conn)?;
    Ok(())
}

fn migrate_content_row(conn: &Connection, old_id: &str, new_id: &str) -> Result<(), StoreError> {
    let info: Option<String> = conn
        .query_row(
            "SELECT info FROM extensions WHERE id = ?1",
            params![old_id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    let Some(info) = info else {
        return Ok(());
    };
    // Rewrite the embedded id when the snapshot parses; keep it verbatim
    // otherwise.
    let rewritten = match serde_json::from_str::<serde_json::Value>(&info) {
        Ok(mut value) => {
            value["id"] = serde_json::Value::String(new_id.to_owned());
            value["marketplace_id"] = serde_json::Value::String(old_id.to_owned());
            value.to_string()
        }
        Err(_) => info,
    };
    conn.execute(
        "UPDATE extensions SET id = ?1, info = ?2 WHERE id = ?3",
        params![new_id, rewritten, old_id],
    )?;
    Ok(())
}
