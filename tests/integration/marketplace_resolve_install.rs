//! Marketplace resolution against a real catalog.
//!
//! The grouped view merges installed rows with manifest entries by
//! base-id; the install flow verifies assets before handing them to the
//! catalog.

use std::collections::BTreeMap;
use std::sync::Arc;

use extension_store::ExtensionCatalog;
use extension_store::manifest::test_support::foxe_bytes;
use marketplace::{
    MarketplaceClient, MarketplaceEntry, MarketplaceError, MarketplaceResolver, VersionEntry,
};

fn panel_entry() -> MarketplaceEntry {
    MarketplaceEntry {
        id: "acme.panel".to_owned(),
        name: "Panel".to_owned(),
        publisher: "acme".to_owned(),
        versions: BTreeMap::from([
            (
                "1.0.0".to_owned(),
                VersionEntry {
                    foxe: Some("https://assets.invalid/panel-1.0.0.foxe".to_owned()),
                    ..VersionEntry::default()
                },
            ),
            (
                "1.1.0".to_owned(),
                VersionEntry {
                    foxe: Some("https://assets.invalid/panel-1.1.0.foxe".to_owned()),
                    published_date: Some("2026-02-01T00:00:00Z".to_owned()),
                    ..VersionEntry::default()
                },
            ),
        ]),
        ..MarketplaceEntry::default()
    }
}

fn resolver() -> (MarketplaceResolver, Arc<ExtensionCatalog>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(ExtensionCatalog::new(dir.path()));
    let client = MarketplaceClient::new("https://marketplace.invalid/extensions.json", None);
    let resolver = MarketplaceResolver::new(client, Arc::clone(&catalog));
    resolver.load_entries(vec![panel_entry()]);
    (resolver, catalog, dir)
}

#[tokio::test]
async fn grouped_view_unions_installed_and_available_versions() {
    let (resolver, catalog, _dir) = resolver();
    catalog
        .install("local", &[foxe_bytes("acme", "panel", "1.0.0", None)])
        .await
        .unwrap();

    let groups = resolver.grouped("local").unwrap();
    assert_eq!(groups.len(), 1);
    let group = &groups[0];
    assert_eq!(group.base_id, "acme.panel");
    assert!(group.installed);
    assert_eq!(group.versions.len(), 2);

    assert_eq!(group.versions[0].version, "1.1.0");
    assert!(!group.versions[0].installed);
    assert!(group.versions[0].is_latest);
    assert_eq!(
        group.versions[0].published_date.as_deref(),
        Some("2026-02-01T00:00:00Z")
    );

    assert_eq!(group.versions[1].version, "1.0.0");
    assert!(group.versions[1].installed);
    assert!(!group.versions[1].is_latest);
}

#[tokio::test]
async fn installed_version_appears_exactly_once_after_reinstall() {
    let (resolver, catalog, _dir) = resolver();
    let bytes = foxe_bytes("acme", "panel", "1.0.0", None);
    catalog.install("local", &[bytes.clone()]).await.unwrap();
    catalog.install("local", &[bytes]).await.unwrap();

    let groups = resolver.grouped("local").unwrap();
    let installed: Vec<_> = groups[0]
        .versions
        .iter()
        .filter(|v| v.installed)
        .collect();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].version, "1.0.0");
}

#[tokio::test]
async fn install_of_a_version_without_an_asset_is_missing_asset() {
    let (resolver, _catalog, _dir) = resolver();
    let err = resolver
        .install("local", "acme.panel", "9.9.9")
        .await
        .unwrap_err();
    assert!(matches!(err, MarketplaceError::MissingAsset(_)));
}

#[tokio::test]
async fn uninstall_through_the_resolver_updates_the_grouped_view() {
    let (resolver, catalog, _dir) = resolver();
    catalog
        .install("local", &[foxe_bytes("acme", "panel", "1.0.0", None)])
        .await
        .unwrap();
    assert!(resolver.grouped("local").unwrap()[0].installed);

    assert!(
        resolver
            .uninstall("local", "acme.panel@1.0.0")
            .await
            .unwrap()
    );
    let groups = resolver.grouped("local").unwrap();
    assert!(!groups[0].installed, "marketplace entry remains, uninstalled");
}

#[tokio::test]
async fn catalog_round_trip_preserves_asset_bytes_and_identity() {
    let (_resolver, catalog, _dir) = resolver();
    let bytes = foxe_bytes("acme", "panel", "1.0.0", Some("# Panel"));
    let infos = catalog.install("local", &[bytes.clone()]).await.unwrap();
    assert_eq!(infos[0].id, "acme.panel@1.0.0");
    assert_eq!(infos[0].marketplace_id, "acme.panel");

    let stored = catalog.load_extension("local", "acme.panel@1.0.0").unwrap();
    assert_eq!(stored, bytes);
    assert!(
        catalog
            .is_any_version_installed("local", "acme.panel")
            .unwrap()
    );
    assert!(!catalog.is_installed("local", "acme.panel").unwrap());
}
