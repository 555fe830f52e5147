//! Extension store schema migration.
//!
//! A v1 store keyed rows by base-id. Opening it must rewrite every row to
//! `base@version` with `marketplace_id` set, exactly once, without
//! re-touching rows already in v2 form.

use std::path::Path;

use extension_store::ExtensionStore;
use rusqlite::Connection;

fn seed_v1(path: &Path, rows: &[(&str, &str)]) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE metadata (
             id             TEXT PRIMARY KEY,
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
         CREATE TABLE extensions (
             id      TEXT PRIMARY KEY,
             content BLOB NOT NULL,
             info    TEXT NOT NULL
         );",
    )
    .unwrap();
    for (base_id, version) in rows {
        let (publisher, name) = base_id.split_once('.').unwrap();
        conn.execute(
            "INSERT INTO metadata
                 (id, name, publisher, version, qualified_name, namespace)
             VALUES (?1, ?2, ?3, ?4, ?1, 'local')",
            rusqlite::params![base_id, name, publisher, version],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO extensions (id, content, info) VALUES (?1, x'0102', ?2)",
            rusqlite::params![
                base_id,
                serde_json::json!({ "id": base_id, "version": version }).to_string()
            ],
        )
        .unwrap();
    }
    conn.pragma_update(None, "user_version", 1).unwrap();
}

#[test]
fn v1_store_opens_with_rows_rekeyed_by_versioned_id() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.sqlite3");
    seed_v1(&path, &[("acme.panel", "1.0.0")]);

    let store = ExtensionStore::open(&path, "local").unwrap();
    let infos = store.list().unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].id, "acme.panel@1.0.0");
    assert_eq!(infos[0].marketplace_id, "acme.panel");
    assert_eq!(infos[0].version, "1.0.0");

    // The old key is gone; content is reachable under the new key.
    assert!(!store.is_installed("acme.panel").unwrap());
    assert_eq!(
        store.load_extension("acme.panel@1.0.0").unwrap(),
        vec![0x01, 0x02]
    );
}

#[test]
fn migration_handles_multiple_publishers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.sqlite3");
    seed_v1(
        &path,
        &[("acme.panel", "1.0.0"), ("zeta.plot", "0.3.1")],
    );

    let store = ExtensionStore::open(&path, "local").unwrap();
    let ids: Vec<String> = store.list().unwrap().into_iter().map(|i| i.id).collect();
    assert_eq!(ids, vec!["acme.panel@1.0.0", "zeta.plot@0.3.1"]);
}

#[test]
fn rerunning_the_migration_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.sqlite3");
    seed_v1(&path, &[("acme.panel", "1.0.0")]);

    drop(ExtensionStore::open(&path, "local").unwrap());
    let first: Vec<_> = ExtensionStore::open(&path, "local")
        .unwrap()
        .list()
        .unwrap();

    // Reset the version marker so the migration path runs again over rows
    // already in v2 form.
    {
        let conn = Connection::open(&path).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();
    }
    let second: Vec<_> = ExtensionStore::open(&path, "local")
        .unwrap()
        .list()
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, "acme.panel@1.0.0");
}

#[test]
fn fresh_store_starts_at_schema_v2() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.sqlite3");
    drop(ExtensionStore::open(&path, "local").unwrap());

    let conn = Connection::open(&path).unwrap();
    let version: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap();
    assert_eq!(version, 2);
}
