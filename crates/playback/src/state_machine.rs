//! Player state sequencing.
//!
//! One handler runs at a time. A transition request while a handler runs
//! records the next state and cancels the handler's token; when the handler
//! returns, the machine loops. An abort thrown while a next state is
//! pending is routed silently; any other error marks the machine errored.
//! `close` overrides everything and is terminal.

use std::sync::{Arc, Mutex};

use scope_core::{PlayerAlert, PlayerPresence, Topic};
use tokio::sync::{Notify, mpsc};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::block_loader::{BlockLoader, BlockLoaderArgs, LoaderEvent};
use crate::buffered::BufferedSource;
use crate::message_handler::MessageHandler;
use crate::player::{PlayerOptions, PlayerShared};
use crate::source::MessageSource;
use crate::{
    BUFFERING_TIMEOUT_MS, MIN_FRAME_TIME_MS, PlaybackError, SEEK_ACK_TIMEOUT_MS, START_DELAY_MS,
};

// ---------------------------------------------------------------------------
// States and the transition table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStateId {
    Preinit,
    Initialize,
    StartPlay,
    Idle,
    SeekBackfill,
    Play,
    ResetPlaybackIterator,
    Close,
}

impl PlayerStateId {
    pub fn name(self) -> &'static str {
        match self {
            PlayerStateId::Preinit => "preinit",
            PlayerStateId::Initialize => "initialize",
            PlayerStateId::StartPlay => "start-play",
            PlayerStateId::Idle => "idle",
            PlayerStateId::SeekBackfill => "seek-backfill",
            PlayerStateId::Play => "play",
            PlayerStateId::ResetPlaybackIterator => "reset-playback-iterator",
            PlayerStateId::Close => "close",
        }
    }
}

/// The only legal (from, to) pairs; anything else is an invariant violation.
pub fn transition_allowed(from: PlayerStateId, to: PlayerStateId) -> bool {
    use PlayerStateId::*;
    matches!(
        (from, to),
        (Preinit, Initialize | Close)
            | (Initialize, StartPlay | Close)
            | (StartPlay, Idle | SeekBackfill | Close)
            | (Idle, Play | SeekBackfill | Close)
            | (Play, Idle | SeekBackfill | ResetPlaybackIterator | Close)
            | (SeekBackfill, Idle | Play | SeekBackfill | Close)
            | (ResetPlaybackIterator, Idle | Play | Close)
    )
}

// ---------------------------------------------------------------------------
// Shared machine state (the handle the facade talks to)
// ---------------------------------------------------------------------------

struct MachineState {
    current: PlayerStateId,
    next: Option<PlayerStateId>,
    cancel: CancellationToken,
    errored: bool,
    closed: bool,
}

pub(crate) struct MachineShared {
    state: Mutex<MachineState>,
    wake: Notify,
}

#[derive(Clone)]
pub(crate) struct MachineHandle {
    inner: Arc<MachineShared>,
}

impl MachineHandle {
    pub(crate) fn new() -> Self {
        MachineHandle {
            inner: Arc::new(MachineShared {
                state: Mutex::new(MachineState {
                    current: PlayerStateId::Preinit,
                    next: None,
                    cancel: CancellationToken::new(),
                    errored: false,
                    closed: false,
                }),
                wake: Notify::new(),
            }),
        }
    }

    pub(crate) fn current(&self) -> PlayerStateId {
        self.inner.state.lock().unwrap().current
    }

    /// Request a transition. Cancels the running handler; the driver picks
    /// the recorded state up when the handler returns.
    pub(crate) fn set_state(&self, to: PlayerStateId) -> Result<(), PlaybackError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Ok(());
        }
        if to == PlayerStateId::Close {
            state.next = Some(PlayerStateId::Close);
            state.cancel.cancel();
            drop(state);
            self.inner.wake.notify_waiters();
            return Ok(());
        }
        if state.errored {
            return Err(PlaybackError::Invariant(
                "player is errored; only close is accepted".to_owned(),
            ));
        }
        if !transition_allowed(state.current, to) {
            return Err(PlaybackError::Invariant(format!(
                "illegal transition {} -> {}",
                state.current.name(),
                to.name()
            )));
        }
        state.next = Some(to);
        state.cancel.cancel();
        drop(state);
        self.inner.wake.notify_waiters();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub(crate) struct PlayerStateMachine {
    pub(crate) shared: Arc<PlayerShared>,
    pub(crate) machine: MachineHandle,
    /// The effective source chain (deserializing over buffered, or buffered).
    pub(crate) source: Arc<dyn MessageSource>,
    pub(crate) buffered: Arc<BufferedSource>,
    pub(crate) options: PlayerOptions,
    pub(crate) handler: Option<MessageHandler>,
    pub(crate) loader_task: Option<tokio::task::JoinHandle<()>>,
    pub(crate) pump_task: Option<tokio::task::JoinHandle<()>>,
    pub(crate) epoch: Instant,
}

impl PlayerStateMachine {
    pub(crate) async fn run(mut self) {
        loop {
            let next = loop {
                let wake = self.machine.inner.wake.notified();
                tokio::pin!(wake);
                wake.as_mut().enable();
                {
                    let mut state = self.machine.inner.state.lock().unwrap();
                    if let Some(next) = state.next.take() {
                        state.current = next;
                        state.cancel = CancellationToken::new();
                        break next;
                    }
                }
                wake.await;
            };
            let token = {
                let state = self.machine.inner.state.lock().unwrap();
                state.cancel.clone()
            };
            debug!(state = next.name(), "entering state");

            let result = self.run_handler(next, token).await;
            if next == PlayerStateId::Close {
                self.machine.inner.state.lock().unwrap().closed = true;
                break;
            }
            match result {
                Ok(Some(auto)) => {
                    let mut state = self.machine.inner.state.lock().unwrap();
                    // Requests recorded while the handler ran take priority.
                    if state.next.is_none() && !state.closed && !state.errored {
                        state.next = Some(auto);
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_abort() => {
                    let pending = self.machine.inner.state.lock().unwrap().next;
                    if pending.is_some() {
                        debug!(state = next.name(), "handler aborted for pending transition");
                    } else {
                        self.enter_errored(next, PlaybackError::Aborted).await;
                    }
                }
                Err(e) => self.enter_errored(next, e).await,
            }
        }
        info!("player state machine closed");
    }

    async fn enter_errored(&mut self, state: PlayerStateId, e: PlaybackError) {
        error!(state = state.name(), error = %e, "state handler failed");
        self.machine.inner.state.lock().unwrap().errored = true;
        self.shared
            .push_alert(PlayerAlert::error("player", e.to_string()));
        self.shared.set_presence(PlayerPresence::Error);
        self.shared.emit().await;
    }

    async fn run_handler(
        &mut self,
        state: PlayerStateId,
        token: CancellationToken,
    ) -> Result<Option<PlayerStateId>, PlaybackError> {
        match state {
            PlayerStateId::Preinit => Ok(None),
            PlayerStateId::Initialize => self.handle_initialize(token).await,
            PlayerStateId::StartPlay => self.handle_start_play(token).await,
            PlayerStateId::Idle => self.handle_idle(token).await,
            PlayerStateId::SeekBackfill => self.handle_seek_backfill(token).await,
            PlayerStateId::Play => self.handle_play(token).await,
            PlayerStateId::ResetPlaybackIterator => self.handle_reset_iterator(token).await,
            PlayerStateId::Close => {
                self.handle_close().await;
                Ok(None)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    async fn handle_initialize(
        &mut self,
        token: CancellationToken,
    ) -> Result<Option<PlayerStateId>, PlaybackError> {
        self.shared.set_presence(PlayerPresence::Initializing);
        self.shared.emit().await;

        let init = tokio::select! {
            r = self.source.initialize() => r.map_err(|e| match e {
                PlaybackError::Aborted => PlaybackError::Aborted,
                other => PlaybackError::Parse(other.to_string()),
            })?,
            () = token.cancelled() => return Err(PlaybackError::Aborted),
        };

        // Duplicate topic names: warn, first schema wins.
        let mut topics: Vec<Topic> = Vec::with_capacity(init.topics.len());
        for topic in &init.topics {
            match topics.iter().find(|t| t.name == topic.name) {
                None => topics.push(topic.clone()),
                Some(first) if first.schema_name != topic.schema_name => {
                    self.shared.push_alert(PlayerAlert::warn(
                        format!("duplicate-topic:{}", topic.name),
                        format!(
                            "topic {} appears with multiple schemas; keeping {:?}",
                            topic.name, first.schema_name
                        ),
                    ));
                }
                Some(_) => {}
            }
        }
        for alert in &init.alerts {
            self.shared.push_alert(alert.clone());
        }

        let controller = &self.shared.controller;
        controller.set_bounds(init.start, init.end);
        let current = controller.seek_target().unwrap_or(init.start);
        controller.set_current_time(current);

        self.shared.freeze_metadata(&init, topics);

        let mut handler = MessageHandler::new(Arc::clone(&self.source), init.start, init.end);
        handler.set_topics(self.shared.all_topics());
        self.handler = Some(handler);

        let loader = BlockLoader::new(
            Arc::clone(&self.source),
            BlockLoaderArgs {
                start: init.start,
                end: init.end,
                max_blocks: self.options.max_blocks,
                min_block_duration_ns: self.options.min_block_duration_ns,
                cache_size_bytes: self.options.block_cache_size_bytes,
            },
        );
        loader.set_topics(self.shared.preload_topics());
        loader.set_active_time(current);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.loader_task = Some(tokio::spawn(Arc::clone(&loader).start_loading(events_tx)));
        self.pump_task = Some(tokio::spawn(pump_loader_events(
            events_rx,
            Arc::clone(&self.shared),
        )));
        self.shared.set_block_loader(loader);

        self.shared.set_presence(PlayerPresence::Present);
        self.shared.emit().await;

        // Give UI subscribers a moment to register before playback starts.
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(START_DELAY_MS)) => {}
            () = token.cancelled() => return Err(PlaybackError::Aborted),
        }
        Ok(Some(PlayerStateId::StartPlay))
    }

    async fn handle_start_play(
        &mut self,
        token: CancellationToken,
    ) -> Result<Option<PlayerStateId>, PlaybackError> {
        if self.shared.controller.seek_target().is_some() {
            return Ok(Some(PlayerStateId::SeekBackfill));
        }
        let shared = Arc::clone(&self.shared);
        let handler = self
            .handler
            .as_mut()
            .ok_or_else(|| PlaybackError::Invariant("start-play before initialize".to_owned()))?;
        handler.set_topics(shared.all_topics());
        let outcome = with_buffering_flip(&shared, &token, handler.read_initial()).await?;

        let current = handler.current_time();
        shared.controller.set_current_time(current);
        if let Some(loader) = shared.block_loader() {
            loader.set_active_time(current);
        }
        for alert in outcome.alerts {
            shared.push_alert(alert);
        }
        shared.stash_messages(outcome.messages);
        shared.emit().await;
        Ok(Some(PlayerStateId::Idle))
    }

    async fn handle_idle(
        &mut self,
        token: CancellationToken,
    ) -> Result<Option<PlayerStateId>, PlaybackError> {
        self.shared.controller.pause_playback();
        self.shared.set_presence(PlayerPresence::Present);
        self.shared.emit().await;

        // Surface buffering progress while parked.
        let mut ranges = self.buffered.loaded_ranges_watch();
        loop {
            tokio::select! {
                () = token.cancelled() => return Err(PlaybackError::Aborted),
                changed = ranges.changed() => {
                    if changed.is_err() {
                        token.cancelled().await;
                        return Err(PlaybackError::Aborted);
                    }
                    let resident = self.buffered.cache_size_bytes();
                    self.shared.update_memory_info("buffered-source", resident);
                    self.shared.emit().await;
                }
            }
        }
    }

    async fn handle_seek_backfill(
        &mut self,
        token: CancellationToken,
    ) -> Result<Option<PlayerStateId>, PlaybackError> {
        let shared = Arc::clone(&self.shared);
        let Some(target) = shared.controller.seek_target() else {
            return Ok(Some(self.play_or_idle()));
        };
        let handler = self
            .handler
            .as_mut()
            .ok_or_else(|| PlaybackError::Invariant("seek before initialize".to_owned()))?;
        handler.set_topics(shared.all_topics());

        let messages = {
            let backfill = handler.read_backfill(target, token.child_token());
            tokio::pin!(backfill);
            tokio::select! {
                r = &mut backfill => r?,
                () = tokio::time::sleep(Duration::from_millis(SEEK_ACK_TIMEOUT_MS)) => {
                    shared.set_presence(PlayerPresence::Buffering);
                    shared.emit().await;
                    backfill.await?
                }
            }
        };

        shared.controller.set_current_time(target);
        if !shared.controller.complete_seek(target) {
            // A newer seek claimed the cursor while we were backfilling.
            return Ok(Some(PlayerStateId::SeekBackfill));
        }
        handler.reset_playback_iterator().await?;
        if let Some(loader) = shared.block_loader() {
            loader.set_active_time(target);
        }
        shared.stash_messages(messages);
        shared.set_presence(PlayerPresence::Present);
        shared.emit().await;
        Ok(Some(self.play_or_idle()))
    }

    async fn handle_play(
        &mut self,
        token: CancellationToken,
    ) -> Result<Option<PlayerStateId>, PlaybackError> {
        let shared = Arc::clone(&self.shared);
        shared.set_presence(PlayerPresence::Present);
        loop {
            if token.is_cancelled() {
                return Err(PlaybackError::Aborted);
            }
            if !shared.controller.is_playing() {
                return Ok(Some(PlayerStateId::Idle));
            }
            let (_, end) = shared.controller.bounds();
            if shared.controller.current_time() >= end {
                shared.controller.pause_playback();
                shared.emit().await;
                return Ok(Some(PlayerStateId::Idle));
            }

            let frame_start = Instant::now();
            let now_millis = self.epoch.elapsed().as_secs_f64() * 1000.0;
            let range_millis = shared.controller.next_range_millis(now_millis);
            let end_time = shared.controller.tick_end_time(range_millis);

            let handler = self
                .handler
                .as_mut()
                .ok_or_else(|| PlaybackError::Invariant("play before initialize".to_owned()))?;
            let outcome = with_buffering_flip(&shared, &token, handler.tick(end_time)).await?;

            shared.controller.set_current_time(end_time);
            if let Some(loader) = shared.block_loader() {
                loader.set_active_time(end_time);
            }
            for alert in outcome.alerts {
                shared.push_alert(alert);
            }
            shared.stash_messages(outcome.messages);
            shared.emit().await;

            if let Some(until) = shared.controller.until_time() {
                if shared.controller.current_time() >= until {
                    shared.controller.pause_playback();
                    shared.emit().await;
                    return Ok(Some(PlayerStateId::Idle));
                }
            }

            let elapsed = frame_start.elapsed();
            let floor = Duration::from_millis(MIN_FRAME_TIME_MS);
            if elapsed < floor {
                tokio::select! {
                    () = tokio::time::sleep(floor - elapsed) => {}
                    () = token.cancelled() => return Err(PlaybackError::Aborted),
                }
            }
        }
    }

    async fn handle_reset_iterator(
        &mut self,
        _token: CancellationToken,
    ) -> Result<Option<PlayerStateId>, PlaybackError> {
        let shared = Arc::clone(&self.shared);
        let handler = self
            .handler
            .as_mut()
            .ok_or_else(|| PlaybackError::Invariant("reset before initialize".to_owned()))?;
        handler.set_topics(shared.all_topics());
        handler.reset_playback_iterator().await?;
        Ok(Some(self.play_or_idle()))
    }

    async fn handle_close(&mut self) {
        info!("closing player");
        if let Some(loader) = self.shared.block_loader() {
            loader.stop_loading().await;
        }
        if let Some(task) = self.loader_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.pump_task.take() {
            let _ = task.await;
        }
        if let Some(handler) = self.handler.as_mut() {
            handler.close_iterator().await;
        }
        self.source.terminate().await;
        self.shared.mark_closed();
    }

    fn play_or_idle(&self) -> PlayerStateId {
        if self.shared.controller.is_playing() {
            PlayerStateId::Play
        } else {
            PlayerStateId::Idle
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Await a drain, flipping presence to Buffering when it runs long.
async fn with_buffering_flip<T>(
    shared: &Arc<PlayerShared>,
    token: &CancellationToken,
    fut: impl Future<Output = Result<T, PlaybackError>>,
) -> Result<T, PlaybackError> {
    tokio::pin!(fut);
    let result = tokio::select! {
        r = &mut fut => r,
        () = token.cancelled() => Err(PlaybackError::Aborted),
        () = tokio::time::sleep(Duration::from_millis(BUFFERING_TIMEOUT_MS)) => {
            shared.set_presence(PlayerPresence::Buffering);
            shared.emit().await;
            let r = tokio::select! {
                r = &mut fut => r,
                () = token.cancelled() => Err(PlaybackError::Aborted),
            };
            if r.is_ok() {
                shared.set_presence(PlayerPresence::Present);
            }
            r
        }
    };
    result
}

async fn pump_loader_events(
    mut events: mpsc::UnboundedReceiver<LoaderEvent>,
    shared: Arc<PlayerShared>,
) {
    while let Some(event) = events.recv().await {
        match event {
            LoaderEvent::Progress {
                message_cache,
                fully_loaded_ranges,
                memory_info,
            } => {
                shared.apply_loader_progress(message_cache, fully_loaded_ranges, memory_info);
            }
            LoaderEvent::Alert(alert) => shared.push_alert(alert),
        }
        shared.emit().await;
    }
}
