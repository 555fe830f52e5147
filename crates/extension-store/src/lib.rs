// extension-store: Versioned extension catalog.
//
// Multiple versions of the same logical extension coexist, keyed by
// versioned-id ("publisher.name@version"). One SQLite database per
// namespace; the catalog is the only writer and serializes operations per
// versioned-id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

pub mod ids;
pub mod manifest;
pub mod store;

pub use ids::{extract_base_id, extract_version, to_versioned_id, validate};
pub use manifest::{ExtensionManifest, FoxePackage, parse_foxe};
pub use store::ExtensionStore;

const EVENT_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store failed integrity check: {0}")]
    Corrupt(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid extension id: {0}")]
    InvalidId(String),
    #[error("extension {0} is not installed")]
    NotInstalled(String),
}

// ---------------------------------------------------------------------------
// Installed extension metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionInfo {
    /// Versioned-id, e.g. `acme.panel@1.0.0`.
    pub id: String,
    /// Base-id, stable across upgrades.
    pub marketplace_id: String,
    pub name: String,
    pub publisher: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub qualified_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
    pub namespace: String,
}

#[derive(Debug, Clone)]
pub enum CatalogEvent {
    Installed {
        namespace: String,
        info: ExtensionInfo,
    },
    Uninstalled {
        namespace: String,
        id: String,
    },
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Process-wide catalog, partitioned by namespace.
///
/// Stores open lazily, one database file per namespace under `root`.
pub struct ExtensionCatalog {
    root: PathBuf,
    stores: Mutex<HashMap<String, Arc<Mutex<ExtensionStore>>>>,
    /// Per versioned-id operation locks; at most one install/uninstall is in
    /// flight for a given id.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    events: broadcast::Sender<CatalogEvent>,
}

impl ExtensionCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        ExtensionCatalog {
            root: root.into(),
            stores: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.events.subscribe()
    }

    fn store_for(&self, namespace: &str) -> Result<Arc<Mutex<ExtensionStore>>, StoreError> {
        let mut stores = self.stores.lock().unwrap();
        if let Some(store) = stores.get(namespace) {
            return Ok(Arc::clone(store));
        }
        std::fs::create_dir_all(&self.root)
            .map_err(|e| StoreError::Storage(format!("creating {}: {e}", self.root.display())))?;
        let path = self.root.join(format!("{namespace}.sqlite3"));
        let store = Arc::new(Mutex::new(ExtensionStore::open(&path, namespace)?));
        stores.insert(namespace.to_owned(), Arc::clone(&store));
        Ok(store)
    }

    fn lock_for(&self, versioned_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        Arc::clone(
            locks
                .entry(versioned_id.to_owned())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Install each buffer; failures abort the remaining buffers but leave
    /// previously installed ones in place (installs are atomic per buffer).
    pub async fn install(
        &self,
        namespace: &str,
        buffers: &[Vec<u8>],
    ) -> Result<Vec<ExtensionInfo>, StoreError> {
        let store = self.store_for(namespace)?;
        let mut installed = Vec::with_capacity(buffers.len());
        for buffer in buffers {
            let package = parse_foxe(buffer)?;
            let versioned_id =
                to_versioned_id(&package.base_id(), &package.manifest.version);
            let lock = self.lock_for(&versioned_id);
            let _guard = lock.lock().await;
            let info = store.lock().unwrap().install(&package, buffer)?;
            let _ = self.events.send(CatalogEvent::Installed {
                namespace: namespace.to_owned(),
                info: info.clone(),
            });
            installed.push(info);
        }
        Ok(installed)
    }

    pub async fn uninstall(&self, namespace: &str, versioned_id: &str) -> Result<bool, StoreError> {
        let store = self.store_for(namespace)?;
        let lock = self.lock_for(versioned_id);
        let _guard = lock.lock().await;
        let removed = store.lock().unwrap().uninstall(versioned_id)?;
        if removed {
            let _ = self.events.send(CatalogEvent::Uninstalled {
                namespace: namespace.to_owned(),
                id: versioned_id.to_owned(),
            });
        }
        Ok(removed)
    }

    pub fn list(&self, namespace: &str) -> Result<Vec<ExtensionInfo>, StoreError> {
        Ok(self.store_for(namespace)?.lock().unwrap().list()?)
    }

    pub fn load_extension(
        &self,
        namespace: &str,
        versioned_id: &str,
    ) -> Result<Vec<u8>, StoreError> {
        self.store_for(namespace)?
            .lock()
            .unwrap()
            .load_extension(versioned_id)
    }

    pub fn is_installed(&self, namespace: &str, versioned_id: &str) -> Result<bool, StoreError> {
        self.store_for(namespace)?
            .lock()
            .unwrap()
            .is_installed(versioned_id)
    }

    pub fn is_any_version_installed(
        &self,
        namespace: &str,
        base_id: &str,
    ) -> Result<bool, StoreError> {
        self.store_for(namespace)?
            .lock()
            .unwrap()
            .is_any_version_installed(base_id)
    }
}
