//! The verified install flow.
//!
//! Resolution goes manifest entry -> versioned asset -> fetched bytes ->
//! checksum verification -> catalog install. At most one operation runs per
//! versioned-id; the per-id status is what the UI renders as a spinner.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use extension_store::{ExtensionCatalog, ExtensionInfo, extract_base_id, to_versioned_id};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::{MarketplaceClient, MarketplaceEntry, MarketplaceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Idle,
    Installing,
    Uninstalling,
    Updating,
}

/// Verify the asset digest when the manifest carries one.
fn verify_checksum(bytes: &[u8], expected: Option<&str>) -> Result<(), MarketplaceError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let expected = expected.trim().to_lowercase();
    let actual = hex::encode(Sha256::digest(bytes));
    if actual != expected {
        return Err(MarketplaceError::IntegrityFailure { expected, actual });
    }
    Ok(())
}

pub struct MarketplaceResolver {
    client: MarketplaceClient,
    catalog: Arc<ExtensionCatalog>,
    entries: RwLock<Vec<MarketplaceEntry>>,
    operations: Mutex<HashMap<String, OperationStatus>>,
}

impl MarketplaceResolver {
    pub fn new(client: MarketplaceClient, catalog: Arc<ExtensionCatalog>) -> Self {
        MarketplaceResolver {
            client,
            catalog,
            entries: RwLock::new(Vec::new()),
            operations: Mutex::new(HashMap::new()),
        }
    }

    /// Re-fetch the manifest and cache the entries.
    pub async fn refresh(&self) -> Result<usize, MarketplaceError> {
        let entries = self.client.fetch_entries().await?;
        let count = entries.len();
        *self.entries.write().unwrap() = entries;
        debug!(count, "marketplace manifest refreshed");
        Ok(count)
    }

    /// Replace the cached entries without a fetch; used for bundled or
    /// offline manifests.
    pub fn load_entries(&self, entries: Vec<MarketplaceEntry>) {
        *self.entries.write().unwrap() = entries;
    }

    pub fn entries(&self) -> Vec<MarketplaceEntry> {
        self.entries.read().unwrap().clone()
    }

    /// The grouped installed-and-available view for one namespace.
    pub fn grouped(&self, namespace: &str) -> Result<Vec<crate::ExtensionGroup>, MarketplaceError> {
        let installed = self.catalog.list(namespace)?;
        Ok(crate::grouped_view(&installed, &self.entries()))
    }

    pub fn operation_status(&self, versioned_id: &str) -> OperationStatus {
        *self
            .operations
            .lock()
            .unwrap()
            .get(versioned_id)
            .unwrap_or(&OperationStatus::Idle)
    }

    fn begin_operation(
        &self,
        versioned_id: &str,
        status: OperationStatus,
    ) -> Result<(), MarketplaceError> {
        let mut operations = self.operations.lock().unwrap();
        match operations.get(versioned_id) {
            None | Some(OperationStatus::Idle) => {
                operations.insert(versioned_id.to_owned(), status);
                Ok(())
            }
            Some(_) => Err(MarketplaceError::Busy(versioned_id.to_owned())),
        }
    }

    fn end_operation(&self, versioned_id: &str) {
        self.operations
            .lock()
            .unwrap()
            .insert(versioned_id.to_owned(), OperationStatus::Idle);
    }

    /// Install `base_id` at `version` from the cached manifest.
    pub async fn install(
        &self,
        namespace: &str,
        base_id: &str,
        version: &str,
    ) -> Result<ExtensionInfo, MarketplaceError> {
        let (foxe_url, sha256sum) = {
            let entries = self.entries.read().unwrap();
            let entry = entries
                .iter()
                .find(|e| e.base_id() == base_id)
                .ok_or_else(|| MarketplaceError::UnknownExtension(base_id.to_owned()))?;
            let details = entry.versions.get(version).ok_or_else(|| {
                MarketplaceError::MissingAsset(format!("{base_id} has no version {version}"))
            })?;
            let foxe = details.foxe.clone().ok_or_else(|| {
                MarketplaceError::MissingAsset(format!(
                    "{base_id}@{version} has no downloadable asset"
                ))
            })?;
            (foxe, details.sha256sum.clone())
        };

        let versioned_id = to_versioned_id(base_id, version);
        let status = if self.catalog.is_any_version_installed(namespace, base_id)? {
            OperationStatus::Updating
        } else {
            OperationStatus::Installing
        };
        self.begin_operation(&versioned_id, status)?;

        let result = async {
            let bytes = self.client.fetch_asset(&foxe_url).await?;
            verify_checksum(&bytes, sha256sum.as_deref())?;
            let mut installed = self.catalog.install(namespace, &[bytes]).await?;
            installed.pop().ok_or_else(|| {
                MarketplaceError::MissingAsset(format!("{versioned_id} produced no install record"))
            })
        }
        .await;

        self.end_operation(&versioned_id);
        if let Ok(info) = &result {
            info!(id = %info.id, "marketplace install complete");
            debug_assert_eq!(extract_base_id(&info.id), base_id);
        }
        result
    }

    pub async fn uninstall(
        &self,
        namespace: &str,
        versioned_id: &str,
    ) -> Result<bool, MarketplaceError> {
        self.begin_operation(versioned_id, OperationStatus::Uninstalling)?;
        let result = self.catalog.uninstall(namespace, versioned_id).await;
        self.end_operation(versioned_id);
        Ok(result?)
    }
}
