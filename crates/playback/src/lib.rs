// playback: Deterministic, seekable, speed-adjustable message playback.
//
// The engine composes a buffered prefetch source, an optional deserializing
// adapter, a block preloader for scrubbing, a tick-driven message handler,
// and a state machine that serializes all transitions. The outward surface
// is the `Player` facade; everything else is plumbing behind it.

use thiserror::Error;

pub mod block_loader;
pub mod buffered;
pub mod controller;
pub mod deserializing;
pub mod message_handler;
pub mod player;
pub mod source;
pub mod state_machine;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use player::{Player, PlayerOptions};
pub use source::{
    BackfillArgs, ConsumptionType, Initialization, MessageIterator, MessageIteratorArgs,
    MessageSource,
};

// ---------------------------------------------------------------------------
// Timing constants
// ---------------------------------------------------------------------------

/// Initial read stops at `start + SEEK_ON_START_NS` so the first emission
/// carries only the messages right at the head of the log.
pub const SEEK_ON_START_NS: i64 = 99_000_000;
/// A drain slower than this flips presence to Buffering until it completes.
pub const BUFFERING_TIMEOUT_MS: u64 = 500;
/// How long a seek may run before presence flips to Buffering.
pub const SEEK_ACK_TIMEOUT_MS: u64 = 100;
/// Pause after initialize so UI subscribers can register before start-play.
pub const START_DELAY_MS: u64 = 100;
/// Upper bound on a single tick's span of log time, pre-speed, in wall ms.
pub const MAX_TICK_DURATION_MS: f64 = 300.0;
/// Floor on play-loop iteration time; keeps emission rate at or under 60 fps.
pub const MIN_FRAME_TIME_MS: u64 = 16;
/// Decode batches are clock-bounded to stay under one 60 fps frame.
pub const DESERIALIZE_BATCH_MS: u64 = 17;
/// Bootstrap tick span before any wall-clock history exists.
pub const BOOTSTRAP_TICK_MS: f64 = 20.0;
/// Forward prefetch window of the buffered source.
pub const DEFAULT_READ_AHEAD_NANOS: i64 = 10 * scope_core::time::NSEC_PER_SEC;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum PlaybackError {
    #[error("network error: {0}")]
    Network(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("operation aborted")]
    Aborted,
    #[error("invariant violation: {0}")]
    Invariant(String),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),
    #[error("precondition violation: {0}")]
    Precondition(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl PlaybackError {
    /// Aborts are swallowed by the state machine when a next state is
    /// pending; every other variant surfaces.
    pub fn is_abort(&self) -> bool {
        matches!(self, PlaybackError::Aborted)
    }
}
