//! Application configuration loading.
//!
//! TOML is the sole file-config source; the marketplace URLs may still be
//! overridden by environment variables (see `launch`).
//!
//! # Required fields
//! - `schema_version = 1`
//!
//! Everything else falls back to defaults sized for single-file playback.

use std::path::Path;

use serde::Deserialize;

use playback::PlayerOptions;
use scope_core::time::NSEC_PER_SEC;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub schema_version: u32,
    pub playback: PlaybackConfig,
    pub blocks: BlocksConfig,
    pub marketplace: MarketplaceConfig,
    pub extensions: ExtensionsConfig,
}

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub read_ahead_seconds: u64,
    pub range_cache_mib: u64,
    pub deserialize_workers: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct BlocksConfig {
    pub max_blocks: usize,
    pub min_block_duration_ms: u64,
    pub cache_mib: u64,
}

#[derive(Debug, Clone)]
pub struct MarketplaceConfig {
    pub url: Option<String>,
    pub fallback_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExtensionsConfig {
    pub storage_dir: String,
}

impl AppConfig {
    /// Player options derived from the playback and block sections.
    pub fn player_options(&self) -> PlayerOptions {
        PlayerOptions {
            read_ahead_nanos: self.playback.read_ahead_seconds as i64 * NSEC_PER_SEC,
            deserialize_workers: self.playback.deserialize_workers,
            max_blocks: self.blocks.max_blocks,
            min_block_duration_ns: self.blocks.min_block_duration_ms as i64 * 1_000_000,
            block_cache_size_bytes: self.blocks.cache_mib * 1024 * 1024,
            url_state: None,
        }
    }

    pub fn range_cache_bytes(&self) -> u64 {
        self.playback.range_cache_mib * 1024 * 1024
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    playback: Option<RawPlaybackConfig>,
    blocks: Option<RawBlocksConfig>,
    marketplace: Option<RawMarketplaceConfig>,
    extensions: Option<RawExtensionsConfig>,
}

#[derive(Debug, Deserialize)]
struct RawPlaybackConfig {
    read_ahead_seconds: Option<u64>,
    range_cache_mib: Option<u64>,
    deserialize_workers: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawBlocksConfig {
    max_blocks: Option<usize>,
    min_block_duration_ms: Option<u64>,
    cache_mib: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawMarketplaceConfig {
    url: Option<String>,
    fallback_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawExtensionsConfig {
    storage_dir: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<AppConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {e}", path.display())))?;
    let config = load_config_from_str(&toml_str)?;
    tracing::debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

pub fn load_config_from_str(toml_str: &str) -> Result<AppConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let playback = match raw.playback {
        Some(p) => PlaybackConfig {
            read_ahead_seconds: p.read_ahead_seconds.unwrap_or(10),
            range_cache_mib: p.range_cache_mib.unwrap_or(500),
            deserialize_workers: p.deserialize_workers,
        },
        None => PlaybackConfig {
            read_ahead_seconds: 10,
            range_cache_mib: 500,
            deserialize_workers: None,
        },
    };
    if playback.read_ahead_seconds == 0 {
        return Err(ConfigError::InvalidValue(
            "playback.read_ahead_seconds must be positive".to_owned(),
        ));
    }

    let blocks = match raw.blocks {
        Some(b) => BlocksConfig {
            max_blocks: b.max_blocks.unwrap_or(400),
            min_block_duration_ms: b.min_block_duration_ms.unwrap_or(100),
            cache_mib: b.cache_mib.unwrap_or(1024),
        },
        None => BlocksConfig {
            max_blocks: 400,
            min_block_duration_ms: 100,
            cache_mib: 1024,
        },
    };
    if blocks.max_blocks == 0 {
        return Err(ConfigError::InvalidValue(
            "blocks.max_blocks must be positive".to_owned(),
        ));
    }

    let marketplace = match raw.marketplace {
        Some(m) => MarketplaceConfig {
            url: m.url,
            fallback_url: m.fallback_url,
        },
        None => MarketplaceConfig {
            url: None,
            fallback_url: None,
        },
    };

    let extensions = match raw.extensions {
        Some(e) => ExtensionsConfig {
            storage_dir: e
                .storage_dir
                .unwrap_or_else(|| default_storage_dir()),
        },
        None => ExtensionsConfig {
            storage_dir: default_storage_dir(),
        },
    };

    Ok(AppConfig {
        schema_version,
        playback,
        blocks,
        marketplace,
        extensions,
    })
}

fn default_storage_dir() -> String {
    "/var/lib/logscope/extensions".to_owned()
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {s}"),
            ConfigError::Parse(s) => write!(f, "Parse error: {s}"),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = load_config_from_str("schema_version = 1").unwrap();
        assert_eq!(config.playback.read_ahead_seconds, 10);
        assert_eq!(config.playback.range_cache_mib, 500);
        assert_eq!(config.blocks.max_blocks, 400);
        assert_eq!(config.blocks.min_block_duration_ms, 100);
        assert!(config.marketplace.url.is_none());
    }

    #[test]
    fn missing_schema_version_fails() {
        let err = load_config_from_str("[playback]\nread_ahead_seconds = 5").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));
    }

    #[test]
    fn wrong_schema_version_fails() {
        let err = load_config_from_str("schema_version = 2").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn zero_read_ahead_is_rejected() {
        let err = load_config_from_str("schema_version = 1\n[playback]\nread_ahead_seconds = 0")
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn player_options_convert_units() {
        let config = load_config_from_str(
            "schema_version = 1\n\
             [playback]\n\
             read_ahead_seconds = 5\n\
             [blocks]\n\
             max_blocks = 20\n\
             min_block_duration_ms = 250\n\
             cache_mib = 2",
        )
        .unwrap();
        let options = config.player_options();
        assert_eq!(options.read_ahead_nanos, 5 * NSEC_PER_SEC);
        assert_eq!(options.max_blocks, 20);
        assert_eq!(options.min_block_duration_ns, 250_000_000);
        assert_eq!(options.block_cache_size_bytes, 2 * 1024 * 1024);
    }

    #[test]
    fn marketplace_urls_pass_through() {
        let config = load_config_from_str(
            "schema_version = 1\n\
             [marketplace]\n\
             url = \"https://mirror.example/ext.json\"\n\
             fallback_url = \"https://backup.example/ext.json\"",
        )
        .unwrap();
        assert_eq!(
            config.marketplace.url.as_deref(),
            Some("https://mirror.example/ext.json")
        );
        assert_eq!(
            config.marketplace.fallback_url.as_deref(),
            Some("https://backup.example/ext.json")
        );
    }
}
