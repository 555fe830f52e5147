// logscope: Robotics log visualization suite.
//
// The heavy lifting lives in the workspace crates; this crate stitches the
// surfaces together (launch parameters, file config) and re-exports the
// public API consumed by a UI shell.

pub mod config;
pub mod launch;

pub use config::{AppConfig, ConfigError, load_config_from_path, load_config_from_str};
pub use launch::{
    DataSourceParam, LaunchError, LaunchParams, MarketplaceUrls, marketplace_urls,
    parse_launch_params,
};

pub use extension_store::{
    CatalogEvent, ExtensionCatalog, ExtensionInfo, StoreError, extract_base_id, extract_version,
    to_versioned_id,
};
pub use marketplace::{
    ExtensionGroup, MarketplaceClient, MarketplaceEntry, MarketplaceError, MarketplaceResolver,
    grouped_view,
};
pub use playback::{Player, PlayerOptions, PlaybackError};
pub use range_reader::{RangeReader, RangeReaderError};
pub use scope_core::{
    MessageEvent, PlayerPresence, PlayerState, PreloadType, SubscribePayload, Time, Topic,
};
