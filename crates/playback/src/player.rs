//! The outward player facade.
//!
//! Assembles the buffered source, optional decode pool, block loader,
//! message handler, controller, and state machine; owns the single
//! listener. State emissions are debounced: while one is in flight at most
//! one follow-up is recorded, and bursts coalesce into it. Each emission
//! hands off the pending message batch and swaps in a shared empty
//! sentinel so a batch is never delivered twice.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use scope_core::{
    ActiveData, BlockCache, Capability, FractionRange, MessageEvent, PlayerAlert,
    PlayerPresence, PlayerState, PreloadType, Progress, SubscribePayload, Time, Topic, UrlState,
};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::block_loader::BlockLoader;
use crate::buffered::BufferedSource;
use crate::controller::PlaybackController;
use crate::deserializing::DeserializingSource;
use crate::source::{Initialization, MessageSource};
use crate::state_machine::{MachineHandle, PlayerStateId, PlayerStateMachine};
use crate::{DEFAULT_READ_AHEAD_NANOS, PlaybackError};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PlayerOptions {
    pub read_ahead_nanos: i64,
    /// `Some(n)` wraps the source in a decode pool of `n` workers.
    pub deserialize_workers: Option<usize>,
    pub max_blocks: usize,
    pub min_block_duration_ns: i64,
    pub block_cache_size_bytes: u64,
    pub url_state: Option<UrlState>,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        PlayerOptions {
            read_ahead_nanos: DEFAULT_READ_AHEAD_NANOS,
            deserialize_workers: None,
            max_blocks: 400,
            min_block_duration_ns: 100_000_000,
            block_cache_size_bytes: 1024 * 1024 * 1024,
            url_state: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared player state (facade + state machine)
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct PlayerMetadata {
    start: Time,
    end: Time,
    topics: Vec<Topic>,
    topic_stats: std::collections::HashMap<String, scope_core::TopicStats>,
    datatypes: std::collections::HashMap<String, serde_json::Value>,
    profile: Option<String>,
    publishers_by_topic: std::collections::HashMap<String, std::collections::HashSet<String>>,
}

#[derive(Default)]
struct Subscriptions {
    payloads: Vec<SubscribePayload>,
    all: Vec<String>,
    preload: Vec<String>,
}

#[derive(Default)]
struct EmitFlags {
    emitting: bool,
    pending: bool,
}

pub(crate) struct PlayerShared {
    pub(crate) controller: PlaybackController,
    player_id: String,
    url_state: Option<UrlState>,
    listener: Mutex<Option<mpsc::Sender<PlayerState>>>,
    emit_flags: Mutex<EmitFlags>,
    presence: Mutex<PlayerPresence>,
    alerts: Mutex<Vec<PlayerAlert>>,
    progress: Mutex<Progress>,
    metadata: Mutex<Option<PlayerMetadata>>,
    messages: Mutex<Arc<Vec<MessageEvent>>>,
    empty_messages: Arc<Vec<MessageEvent>>,
    subscriptions: Mutex<Subscriptions>,
    block_loader: Mutex<Option<Arc<BlockLoader>>>,
    closed_tx: watch::Sender<bool>,
}

impl PlayerShared {
    fn new(url_state: Option<UrlState>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        let empty_messages: Arc<Vec<MessageEvent>> = Arc::new(Vec::new());
        PlayerShared {
            controller: PlaybackController::new(),
            player_id: uuid::Uuid::new_v4().to_string(),
            url_state,
            listener: Mutex::new(None),
            emit_flags: Mutex::new(EmitFlags::default()),
            presence: Mutex::new(PlayerPresence::NotPresent),
            alerts: Mutex::new(Vec::new()),
            progress: Mutex::new(Progress::default()),
            metadata: Mutex::new(None),
            messages: Mutex::new(Arc::clone(&empty_messages)),
            empty_messages,
            subscriptions: Mutex::new(Subscriptions::default()),
            block_loader: Mutex::new(None),
            closed_tx,
        }
    }

    // -- presence / alerts / progress ---------------------------------------

    pub(crate) fn set_presence(&self, presence: PlayerPresence) {
        *self.presence.lock().unwrap() = presence;
    }

    /// Insert or replace (by id) an alert.
    pub(crate) fn push_alert(&self, alert: PlayerAlert) {
        let mut alerts = self.alerts.lock().unwrap();
        match alerts.iter_mut().find(|a| a.id == alert.id) {
            Some(existing) => *existing = alert,
            None => alerts.push(alert),
        }
    }

    pub(crate) fn apply_loader_progress(
        &self,
        message_cache: Arc<BlockCache>,
        fully_loaded_ranges: Vec<FractionRange>,
        memory_info: std::collections::HashMap<String, u64>,
    ) {
        let mut progress = self.progress.lock().unwrap();
        progress.message_cache = Some(message_cache);
        progress.fully_loaded_fraction_ranges = Some(fully_loaded_ranges);
        progress.memory_info.extend(memory_info);
    }

    pub(crate) fn update_memory_info(&self, component: &str, bytes: u64) {
        self.progress
            .lock()
            .unwrap()
            .memory_info
            .insert(component.to_owned(), bytes);
    }

    // -- metadata / subscriptions -------------------------------------------

    pub(crate) fn freeze_metadata(&self, init: &Initialization, topics: Vec<Topic>) {
        *self.metadata.lock().unwrap() = Some(PlayerMetadata {
            start: init.start,
            end: init.end,
            topics,
            topic_stats: init.topic_stats.clone(),
            datatypes: init.datatypes.clone(),
            profile: init.profile.clone(),
            publishers_by_topic: init.publishers_by_topic.clone(),
        });
    }

    /// Returns true when the set actually changed.
    pub(crate) fn update_subscriptions(&self, payloads: Vec<SubscribePayload>) -> bool {
        let mut subs = self.subscriptions.lock().unwrap();
        if subs.payloads == payloads {
            return false;
        }
        let all: BTreeSet<&str> = payloads.iter().map(|p| p.topic.as_str()).collect();
        let preload: BTreeSet<&str> = payloads
            .iter()
            .filter(|p| p.preload_type == PreloadType::Full)
            .map(|p| p.topic.as_str())
            .collect();
        subs.all = all.into_iter().map(str::to_owned).collect();
        subs.preload = preload.into_iter().map(str::to_owned).collect();
        subs.payloads = payloads;
        true
    }

    pub(crate) fn all_topics(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().all.clone()
    }

    pub(crate) fn preload_topics(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().preload.clone()
    }

    pub(crate) fn set_block_loader(&self, loader: Arc<BlockLoader>) {
        *self.block_loader.lock().unwrap() = Some(loader);
    }

    pub(crate) fn block_loader(&self) -> Option<Arc<BlockLoader>> {
        self.block_loader.lock().unwrap().clone()
    }

    // -- messages ------------------------------------------------------------

    pub(crate) fn stash_messages(&self, mut new: Vec<MessageEvent>) {
        if new.is_empty() {
            return;
        }
        let mut messages = self.messages.lock().unwrap();
        if messages.is_empty() {
            *messages = Arc::new(new);
        } else {
            Arc::make_mut(&mut messages).append(&mut new);
        }
    }

    // -- emission ------------------------------------------------------------

    fn begin_emit(&self) -> bool {
        let mut flags = self.emit_flags.lock().unwrap();
        if flags.emitting {
            flags.pending = true;
            false
        } else {
            flags.emitting = true;
            true
        }
    }

    fn continue_emit(&self) -> bool {
        let mut flags = self.emit_flags.lock().unwrap();
        if flags.pending {
            flags.pending = false;
            true
        } else {
            flags.emitting = false;
            false
        }
    }

    fn snapshot(&self) -> PlayerState {
        let active_data = self.metadata.lock().unwrap().clone().map(|m| {
            let messages = {
                let mut messages = self.messages.lock().unwrap();
                std::mem::replace(&mut *messages, Arc::clone(&self.empty_messages))
            };
            let current_time = self
                .controller
                .current_time()
                .clamp_to(m.start, m.end);
            ActiveData {
                messages,
                current_time,
                start_time: m.start,
                end_time: m.end,
                is_playing: self.controller.is_playing(),
                speed: self.controller.speed(),
                last_seek_time: self.controller.last_seek_time(),
                topics: m.topics,
                topic_stats: m.topic_stats,
                datatypes: m.datatypes,
                published_topics: Some(m.publishers_by_topic),
            }
        });
        PlayerState {
            presence: *self.presence.lock().unwrap(),
            progress: self.progress.lock().unwrap().clone(),
            active_data,
            alerts: self.alerts.lock().unwrap().clone(),
            player_id: self.player_id.clone(),
            url_state: self.url_state.clone(),
            capabilities: vec![Capability::PlaybackControl, Capability::SetSpeed],
            profile: self
                .metadata
                .lock()
                .unwrap()
                .as_ref()
                .and_then(|m| m.profile.clone()),
        }
    }

    /// Deliver the current state to the listener, coalescing bursts.
    pub(crate) async fn emit(&self) {
        if *self.closed_tx.borrow() {
            return;
        }
        if !self.begin_emit() {
            return;
        }
        loop {
            let state = self.snapshot();
            let listener = self.listener.lock().unwrap().clone();
            if let Some(listener) = listener {
                let _ = listener.send(state).await;
            }
            if *self.closed_tx.borrow() || !self.continue_emit() {
                break;
            }
        }
    }

    pub(crate) fn mark_closed(&self) {
        let _ = self.closed_tx.send(true);
    }
}

// ---------------------------------------------------------------------------
// Player
// ---------------------------------------------------------------------------

/// Single-use playback facade: constructed, given a listener, driven, then
/// closed. Once closed it cannot be reopened.
pub struct Player {
    shared: Arc<PlayerShared>,
    machine: MachineHandle,
}

impl Player {
    pub fn new(source: Arc<dyn MessageSource>, options: PlayerOptions) -> Self {
        let buffered = Arc::new(BufferedSource::with_read_ahead(
            source,
            options.read_ahead_nanos,
        ));
        let effective: Arc<dyn MessageSource> = match options.deserialize_workers {
            Some(workers) => Arc::new(DeserializingSource::with_workers(
                Arc::clone(&buffered) as Arc<dyn MessageSource>,
                workers,
            )),
            None => Arc::clone(&buffered) as Arc<dyn MessageSource>,
        };
        let shared = Arc::new(PlayerShared::new(options.url_state.clone()));
        let machine = MachineHandle::new();
        let driver = PlayerStateMachine {
            shared: Arc::clone(&shared),
            machine: machine.clone(),
            source: effective,
            buffered,
            options: options.clone(),
            handler: None,
            loader_task: None,
            pump_task: None,
            epoch: tokio::time::Instant::now(),
        };
        tokio::spawn(driver.run());
        Player { shared, machine }
    }

    /// Register the sole recipient of player states and begin initializing.
    ///
    /// Calling twice is an error.
    pub fn set_listener(&self, listener: mpsc::Sender<PlayerState>) -> Result<(), PlaybackError> {
        {
            let mut slot = self.shared.listener.lock().unwrap();
            if slot.is_some() {
                return Err(PlaybackError::Invariant(
                    "listener already registered".to_owned(),
                ));
            }
            *slot = Some(listener);
        }
        self.machine.set_state(PlayerStateId::Initialize)
    }

    pub fn start_playback(&self) -> Result<(), PlaybackError> {
        if !self.shared.controller.start_playback() {
            return Ok(());
        }
        if self.machine.current() == PlayerStateId::Idle {
            self.machine.set_state(PlayerStateId::Play)
        } else {
            Ok(())
        }
    }

    pub fn pause_playback(&self) -> Result<(), PlaybackError> {
        self.shared.controller.pause_playback();
        if self.machine.current() == PlayerStateId::Play {
            self.machine.set_state(PlayerStateId::Idle)
        } else {
            Ok(())
        }
    }

    /// Play forward to `t`, then pause.
    pub fn play_until(&self, t: Time) -> Result<(), PlaybackError> {
        if self.shared.controller.play_until(t)?
            && self.machine.current() == PlayerStateId::Idle
        {
            self.machine.set_state(PlayerStateId::Play)
        } else {
            Ok(())
        }
    }

    pub fn seek_playback(&self, t: Time) -> Result<(), PlaybackError> {
        if !self.shared.controller.seek_playback(t) {
            debug!(%t, "duplicate seek ignored");
            return Ok(());
        }
        match self.machine.current() {
            PlayerStateId::Idle
            | PlayerStateId::Play
            | PlayerStateId::SeekBackfill
            | PlayerStateId::StartPlay => self.machine.set_state(PlayerStateId::SeekBackfill),
            // Before start-play the target is picked up by initialization.
            _ => Ok(()),
        }
    }

    pub fn set_playback_speed(&self, speed: f64) -> Result<(), PlaybackError> {
        self.shared.controller.set_speed(speed)?;
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { shared.emit().await });
        Ok(())
    }

    /// Update subscriptions; newly subscribed topics are backfilled at the
    /// cursor, or folded into the playback iterator when already playing.
    pub fn set_subscriptions(&self, payloads: Vec<SubscribePayload>) -> Result<(), PlaybackError> {
        if !self.shared.update_subscriptions(payloads) {
            return Ok(());
        }
        if let Some(loader) = self.shared.block_loader() {
            loader.set_topics(self.shared.preload_topics());
        }
        let current = self.machine.current();
        if self.shared.controller.is_playing() {
            if current == PlayerStateId::Play {
                return self.machine.set_state(PlayerStateId::ResetPlaybackIterator);
            }
            return Ok(());
        }
        match current {
            PlayerStateId::Idle
            | PlayerStateId::SeekBackfill
            | PlayerStateId::Play
            | PlayerStateId::StartPlay => {
                self.shared
                    .controller
                    .force_seek_target(self.shared.controller.current_time());
                self.machine.set_state(PlayerStateId::SeekBackfill)
            }
            _ => Ok(()),
        }
    }

    // -- unsupported surfaces ------------------------------------------------

    pub fn publish(&self, _topic: &str, _message: &serde_json::Value) -> Result<(), PlaybackError> {
        Err(PlaybackError::UnsupportedOperation("publish"))
    }

    pub fn set_parameter(&self, _name: &str, _value: &serde_json::Value) -> Result<(), PlaybackError> {
        Err(PlaybackError::UnsupportedOperation("parameters"))
    }

    pub fn call_service(&self, _service: &str, _request: &serde_json::Value) -> Result<(), PlaybackError> {
        Err(PlaybackError::UnsupportedOperation("services"))
    }

    // -- lifecycle -----------------------------------------------------------

    /// Close the player and wait for teardown to finish.
    pub async fn close(&self) {
        let _ = self.machine.set_state(PlayerStateId::Close);
        self.closed().await;
    }

    /// Resolves when the close handler has finished. No state emissions
    /// happen afterwards.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
