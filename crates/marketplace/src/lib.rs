// marketplace: Remote extension manifest resolution.
//
// Fetches the marketplace manifest (with a fallback URL), groups installed
// and available versions by base-id, and runs the verified install flow
// against the extension catalog.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub mod grouped;
pub mod resolver;

pub use grouped::{ExtensionGroup, VersionRow, grouped_view};
pub use resolver::{MarketplaceResolver, OperationStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum MarketplaceError {
    #[error("network error: {0}")]
    Network(String),
    #[error("no marketplace entry for {0}")]
    UnknownExtension(String),
    #[error("missing asset: {0}")]
    MissingAsset(String),
    #[error("integrity failure: expected sha256 {expected}, got {actual}")]
    IntegrityFailure { expected: String, actual: String },
    #[error("another operation is in flight for {0}")]
    Busy(String),
    #[error(transparent)]
    Storage(#[from] extension_store::StoreError),
}

// ---------------------------------------------------------------------------
// Manifest format
// ---------------------------------------------------------------------------

/// One version of a marketplace entry. Missing optional fields stay
/// absent; the resolver never fills defaults in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    #[serde(default, rename = "publishedDate", skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256sum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foxe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<bool>,
}

/// One entry of the `extensions.json` manifest, keyed by base-id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketplaceEntry {
    pub id: String,
    pub name: String,
    pub publisher: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
    #[serde(default)]
    pub versions: BTreeMap<String, VersionEntry>,
    /// Versions deprecated wholesale, in addition to per-version flags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<Vec<String>>,
}

impl MarketplaceEntry {
    pub fn base_id(&self) -> &str {
        extension_store::extract_base_id(&self.id)
    }

    pub fn is_version_deprecated(&self, version: &str) -> bool {
        if self
            .deprecated
            .as_ref()
            .is_some_and(|list| list.iter().any(|v| v == version))
        {
            return true;
        }
        self.versions
            .get(version)
            .and_then(|v| v.deprecated)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Fetches `extensions.json` from the configured URL, falling back to the
/// secondary URL when the primary is unreachable.
pub struct MarketplaceClient {
    http: reqwest::Client,
    url: String,
    fallback_url: Option<String>,
}

impl MarketplaceClient {
    pub fn new(url: impl Into<String>, fallback_url: Option<String>) -> Self {
        MarketplaceClient {
            http: reqwest::Client::new(),
            url: url.into(),
            fallback_url,
        }
    }

    pub async fn fetch_entries(&self) -> Result<Vec<MarketplaceEntry>, MarketplaceError> {
        match self.fetch_from(&self.url).await {
            Ok(entries) => Ok(entries),
            Err(primary) => match &self.fallback_url {
                Some(fallback) => {
                    warn!(error = %primary, url = %fallback, "primary manifest fetch failed, trying fallback");
                    self.fetch_from(fallback).await
                }
                None => Err(primary),
            },
        }
    }

    async fn fetch_from(&self, url: &str) -> Result<Vec<MarketplaceEntry>, MarketplaceError> {
        debug!(url, "fetching marketplace manifest");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| MarketplaceError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MarketplaceError::Network(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        response
            .json::<Vec<MarketplaceEntry>>()
            .await
            .map_err(|e| MarketplaceError::Network(format!("invalid manifest from {url}: {e}")))
    }

    pub async fn fetch_asset(&self, url: &str) -> Result<Vec<u8>, MarketplaceError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| MarketplaceError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MarketplaceError::Network(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| MarketplaceError::Network(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}
