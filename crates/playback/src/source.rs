//! The source contract consumed by the playback engine.
//!
//! A source is an opaque, initialized-once reader over a single log. The
//! byte-level container parser lives outside this crate; anything that can
//! answer `initialize`, serve a forward iterator, and backfill per-topic
//! latest messages can drive the player.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use scope_core::{IteratorResult, MessageEvent, PlayerAlert, Time, Topic, TopicStats};
use tokio_util::sync::CancellationToken;

use crate::PlaybackError;

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// Frozen metadata returned by `MessageSource::initialize`.
#[derive(Debug, Clone, Default)]
pub struct Initialization {
    pub start: Time,
    pub end: Time,
    pub topics: Vec<Topic>,
    pub datatypes: HashMap<String, serde_json::Value>,
    pub profile: Option<String>,
    pub topic_stats: HashMap<String, TopicStats>,
    pub alerts: Vec<PlayerAlert>,
    pub publishers_by_topic: HashMap<String, HashSet<String>>,
    pub name: Option<String>,
    pub metadata: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Iterator arguments
// ---------------------------------------------------------------------------

/// How the iterator's results will be consumed.
///
/// `Partial` readers track a moving cursor and want low latency; `Full`
/// readers (block preloading) drain whole ranges and want throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumptionType {
    Full,
    Partial,
}

#[derive(Debug, Clone)]
pub struct MessageIteratorArgs {
    pub topics: Vec<String>,
    pub start: Time,
    /// Inclusive; `None` reads to the end of the log.
    pub end: Option<Time>,
    pub consumption_type: ConsumptionType,
}

#[derive(Debug, Clone)]
pub struct BackfillArgs {
    pub topics: Vec<String>,
    pub time: Time,
    pub cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// A pull-based, cancellable sequence of iterator results.
///
/// `finish` is the cleanup hook; callers invoke it exactly once when done
/// (dropping without `finish` must not leak, but may skip graceful teardown
/// of upstream readers).
#[async_trait]
pub trait MessageIterator: Send {
    async fn next(&mut self) -> Option<Result<IteratorResult, PlaybackError>>;

    async fn finish(&mut self) {}
}

/// An initialized-once log reader.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn initialize(&self) -> Result<Initialization, PlaybackError>;

    async fn message_iterator(
        &self,
        args: MessageIteratorArgs,
    ) -> Result<Box<dyn MessageIterator>, PlaybackError>;

    /// The most recent message on each requested topic at or before `time`.
    async fn get_backfill_messages(
        &self,
        args: BackfillArgs,
    ) -> Result<Vec<MessageEvent>, PlaybackError>;

    async fn terminate(&self) {}
}
