//! Launch parameter parsing.
//!
//! Startup state arrives as URL query parameters
//! (`?ds=remote-file&ds.url=<u1>,<u2>&defaultLayout=<id>&time=<ISO-8601>`)
//! plus environment overrides for the marketplace manifest URLs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub const DEFAULT_EXTENSION_MARKETPLACE_URL: &str =
    "https://marketplace.logscope.dev/extensions.json";
pub const DEFAULT_LAYOUT_MARKETPLACE_URL: &str = "https://marketplace.logscope.dev/layouts.json";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("unknown data source kind {0:?}")]
    UnknownDataSource(String),
    #[error("data source {0:?} requires a ds.url parameter")]
    MissingUrl(String),
    #[error("invalid time parameter {0:?}")]
    InvalidTime(String),
}

/// The initial data source selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSourceParam {
    RemoteFile { urls: Vec<String> },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchParams {
    pub data_source: Option<DataSourceParam>,
    pub default_layout: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match decoded {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .trim_start_matches('?')
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((percent_decode(key), percent_decode(value)))
        })
        .collect()
}

/// Parse a query string into typed launch parameters. Unknown keys are
/// ignored.
pub fn parse_launch_params(query: &str) -> Result<LaunchParams, LaunchError> {
    let params = parse_query(query);
    let mut launch = LaunchParams::default();

    if let Some(kind) = params.get("ds") {
        match kind.as_str() {
            "remote-file" => {
                let urls: Vec<String> = params
                    .get("ds.url")
                    .map(|list| {
                        list.split(',')
                            .map(str::trim)
                            .filter(|u| !u.is_empty())
                            .map(str::to_owned)
                            .collect()
                    })
                    .unwrap_or_default();
                if urls.is_empty() {
                    return Err(LaunchError::MissingUrl(kind.clone()));
                }
                launch.data_source = Some(DataSourceParam::RemoteFile { urls });
            }
            other => return Err(LaunchError::UnknownDataSource(other.to_owned())),
        }
    }

    launch.default_layout = params.get("defaultLayout").cloned();

    if let Some(time) = params.get("time") {
        let parsed = DateTime::parse_from_rfc3339(time)
            .map_err(|_| LaunchError::InvalidTime(time.clone()))?;
        launch.start_time = Some(parsed.with_timezone(&Utc));
    }

    Ok(launch)
}

// ---------------------------------------------------------------------------
// Marketplace URL overrides
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketplaceUrls {
    pub extensions: String,
    pub layouts: String,
}

/// Resolve marketplace URLs from the environment, falling back to the
/// defaults.
pub fn marketplace_urls() -> MarketplaceUrls {
    marketplace_urls_from(
        std::env::var("EXTENSION_MARKETPLACE_URL").ok(),
        std::env::var("LAYOUT_MARKETPLACE_URL").ok(),
    )
}

fn marketplace_urls_from(
    extension_override: Option<String>,
    layout_override: Option<String>,
) -> MarketplaceUrls {
    MarketplaceUrls {
        extensions: extension_override
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_EXTENSION_MARKETPLACE_URL.to_owned()),
        layouts: layout_override
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_LAYOUT_MARKETPLACE_URL.to_owned()),
    }
}
