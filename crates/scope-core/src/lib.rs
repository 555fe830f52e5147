// scope-core: Shared types for the playback engine and its UI listener.
//
// Everything the player emits crosses an in-process channel, so these types
// favor cheap clones (`Arc` payloads) over wire serialization. Serde derives
// exist only where a type also appears in config or manifest JSON.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod ranges;
pub mod time;

pub use ranges::{FractionRange, merge_ranges};
pub use time::Time;

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// A named message channel within a log.
///
/// Names are opaque strings. Duplicate names with differing schemas are a
/// warning condition; the first schema wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    /// Set when the topic was renamed by an alias layer upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliased_from_name: Option<String>,
}

impl Topic {
    pub fn new(name: impl Into<String>, schema_name: Option<&str>) -> Self {
        Topic {
            name: name.into(),
            schema_name: schema_name.map(str::to_owned),
            aliased_from_name: None,
        }
    }
}

/// Per-topic statistics frozen at initialization time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopicStats {
    pub num_messages: u64,
    pub first_message_time: Option<Time>,
    pub last_message_time: Option<Time>,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Message body, either raw log bytes or a decoded value.
///
/// `DeserializingSource` turns `Serialized` payloads into `Decoded` ones;
/// sources that decode internally may emit `Decoded` directly.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    Serialized(Arc<[u8]>),
    Decoded(Arc<serde_json::Value>),
}

impl MessagePayload {
    pub fn is_serialized(&self) -> bool {
        matches!(self, MessagePayload::Serialized(_))
    }
}

/// A single message crossed by the playback cursor or loaded into a block.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub topic: String,
    pub receive_time: Time,
    pub message: MessagePayload,
    pub schema_name: String,
    pub size_in_bytes: u64,
}

/// One result pulled from a forward message iterator.
#[derive(Debug, Clone, PartialEq)]
pub enum IteratorResult {
    Message(MessageEvent),
    /// Time progress with no message; advances the cursor through regions
    /// where no subscribed topic has data.
    Stamp(Time),
    Alert(PlayerAlert),
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// How eagerly a subscribed topic's history should be materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreloadType {
    /// Only messages crossed by the playback cursor.
    Partial,
    /// Additionally populate the block cache for scrubbing.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    pub preload_type: PreloadType,
}

impl SubscribePayload {
    pub fn partial(topic: impl Into<String>) -> Self {
        SubscribePayload {
            topic: topic.into(),
            fields: None,
            preload_type: PreloadType::Partial,
        }
    }

    pub fn full(topic: impl Into<String>) -> Self {
        SubscribePayload {
            topic: topic.into(),
            fields: None,
            preload_type: PreloadType::Full,
        }
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Error,
    Warn,
    Info,
}

/// A user-visible condition surfaced on every state emission.
///
/// Alerts never cross the listener boundary as errors; the UI may display
/// them and continue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerAlert {
    /// Stable key; re-emitting the same id replaces the previous alert.
    pub id: String,
    pub severity: AlertSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tip: Option<String>,
}

impl PlayerAlert {
    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        PlayerAlert {
            id: id.into(),
            severity: AlertSeverity::Error,
            message: message.into(),
            tip: None,
        }
    }

    pub fn warn(id: impl Into<String>, message: impl Into<String>) -> Self {
        PlayerAlert {
            id: id.into(),
            severity: AlertSeverity::Warn,
            message: message.into(),
            tip: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

/// Messages preloaded for one block of the log timespan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub messages_by_topic: HashMap<String, Vec<MessageEvent>>,
    pub size_in_bytes: u64,
}

/// The scrubbing cache: one optional slot per block index.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockCache {
    pub blocks: Vec<Option<Arc<Block>>>,
    pub start_time: Time,
    pub end_time: Time,
}

// ---------------------------------------------------------------------------
// Player state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerPresence {
    NotPresent,
    Initializing,
    Present,
    Buffering,
    Reconnecting,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    PlaybackControl,
    SetSpeed,
}

/// Data-source identity echoed back to the UI for deep links.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlState {
    pub source_id: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Preload progress reported alongside every state emission.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub fully_loaded_fraction_ranges: Option<Vec<FractionRange>>,
    pub message_cache: Option<Arc<BlockCache>>,
    /// Component name -> resident bytes.
    pub memory_info: HashMap<String, u64>,
}

/// Frozen metadata plus the per-tick payload.
#[derive(Debug, Clone)]
pub struct ActiveData {
    pub messages: Arc<Vec<MessageEvent>>,
    pub current_time: Time,
    pub start_time: Time,
    pub end_time: Time,
    pub is_playing: bool,
    pub speed: f64,
    /// Monotonic counter bumped on every completed backfill.
    pub last_seek_time: u64,
    pub topics: Vec<Topic>,
    pub topic_stats: HashMap<String, TopicStats>,
    pub datatypes: HashMap<String, serde_json::Value>,
    pub published_topics: Option<HashMap<String, HashSet<String>>>,
}

/// The complete snapshot handed to the single registered listener.
#[derive(Debug, Clone)]
pub struct PlayerState {
    pub presence: PlayerPresence,
    pub progress: Progress,
    pub active_data: Option<ActiveData>,
    pub alerts: Vec<PlayerAlert>,
    pub player_id: String,
    pub url_state: Option<UrlState>,
    pub capabilities: Vec<Capability>,
    pub profile: Option<String>,
}
