//! Block preloading for scrubbing.
//!
//! The log timespan is partitioned into equal blocks. Full-preload topics
//! are drained block by block into a bounded cache, nearest-to-cursor
//! first. Each completed block emits a progress event carrying the whole
//! cache snapshot. A pass visits every block once; topic or cursor changes
//! wake the loader for another pass, which is how evicted regions reload.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use scope_core::{
    Block, BlockCache, FractionRange, IteratorResult, PlayerAlert, Time, merge_ranges,
};
use tokio::sync::{Notify, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::source::{ConsumptionType, MessageIteratorArgs, MessageSource};
use crate::PlaybackError;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BlockLoaderArgs {
    pub start: Time,
    pub end: Time,
    pub max_blocks: usize,
    pub min_block_duration_ns: i64,
    pub cache_size_bytes: u64,
}

/// Events published while loading runs.
#[derive(Debug, Clone)]
pub enum LoaderEvent {
    Progress {
        message_cache: Arc<BlockCache>,
        /// Fractions of the log whose blocks hold every preload topic.
        fully_loaded_ranges: Vec<FractionRange>,
        memory_info: HashMap<String, u64>,
    },
    Alert(PlayerAlert),
}

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Slot {
    block: Option<Arc<Block>>,
    loaded_topics: HashSet<String>,
    failed: bool,
}

struct LoaderState {
    slots: Vec<Slot>,
}

// ---------------------------------------------------------------------------
// BlockLoader
// ---------------------------------------------------------------------------

pub struct BlockLoader {
    source: Arc<dyn MessageSource>,
    start: Time,
    end: Time,
    block_count: usize,
    block_duration_ns: i64,
    cache_size_bytes: u64,
    state: Mutex<LoaderState>,
    topics: Mutex<BTreeSet<String>>,
    active_index: AtomicUsize,
    wake: Notify,
    stop: CancellationToken,
    running_tx: watch::Sender<bool>,
    events: Mutex<Option<mpsc::UnboundedSender<LoaderEvent>>>,
}

impl BlockLoader {
    pub fn new(source: Arc<dyn MessageSource>, args: BlockLoaderArgs) -> Arc<Self> {
        let span = args.end.nanos_since(args.start).max(0);
        let by_duration = if args.min_block_duration_ns > 0 {
            (((span + args.min_block_duration_ns - 1) / args.min_block_duration_ns).max(1)) as usize
        } else {
            1
        };
        let block_count = by_duration.min(args.max_blocks.max(1));
        let divisor = block_count as i64;
        let block_duration_ns = (((span + divisor - 1) / divisor).max(1)) as i64;
        let (running_tx, _) = watch::channel(false);
        Arc::new(BlockLoader {
            source,
            start: args.start,
            end: args.end,
            block_count,
            block_duration_ns,
            cache_size_bytes: args.cache_size_bytes,
            state: Mutex::new(LoaderState {
                slots: (0..block_count).map(|_| Slot::default()).collect(),
            }),
            topics: Mutex::new(BTreeSet::new()),
            active_index: AtomicUsize::new(0),
            wake: Notify::new(),
            stop: CancellationToken::new(),
            running_tx,
            events: Mutex::new(None),
        })
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Inclusive time range covered by a block.
    fn block_range(&self, index: usize) -> (Time, Time) {
        let from = self.start.add_nanos(index as i64 * self.block_duration_ns);
        let to = if index + 1 == self.block_count {
            self.end
        } else {
            self.start
                .add_nanos((index as i64 + 1) * self.block_duration_ns - 1)
        };
        (from, to.clamp_to(self.start, self.end))
    }

    /// Replace the full-preload topic set.
    ///
    /// Slots keep messages for topics still in the set; topics no longer
    /// preloaded are dropped immediately. Failed slots get another chance.
    pub fn set_topics(&self, topics: impl IntoIterator<Item = String>) {
        let new_set: BTreeSet<String> = topics.into_iter().collect();
        {
            let mut current = self.topics.lock().unwrap();
            if *current == new_set {
                return;
            }
            *current = new_set.clone();
        }
        {
            let mut state = self.state.lock().unwrap();
            for slot in &mut state.slots {
                slot.failed = false;
                slot.loaded_topics.retain(|t| new_set.contains(t));
                if let Some(block) = &slot.block {
                    if block
                        .messages_by_topic
                        .keys()
                        .any(|t| !new_set.contains(t))
                    {
                        let mut trimmed = Block::default();
                        for (topic, messages) in &block.messages_by_topic {
                            if new_set.contains(topic) {
                                trimmed.size_in_bytes +=
                                    messages.iter().map(|m| m.size_in_bytes).sum::<u64>();
                                trimmed
                                    .messages_by_topic
                                    .insert(topic.clone(), messages.clone());
                            }
                        }
                        slot.block = Some(Arc::new(trimmed));
                    }
                }
            }
        }
        // Push a refreshed snapshot so the UI sees trims immediately; newly
        // missing topics arrive with the next pass.
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(self.progress_event());
        }
        self.wake.notify_waiters();
    }

    /// Point the priority order at the block containing `time`.
    pub fn set_active_time(&self, time: Time) {
        let offset = time.clamp_to(self.start, self.end).nanos_since(self.start);
        let index =
            ((offset / self.block_duration_ns) as usize).min(self.block_count.saturating_sub(1));
        let previous = self.active_index.swap(index, Ordering::SeqCst);
        if previous != index {
            self.wake.notify_waiters();
        }
    }

    /// Abort the in-flight block read and wait for the loader to go idle.
    pub async fn stop_loading(&self) {
        self.stop.cancel();
        self.wake.notify_waiters();
        let mut running = self.running_tx.subscribe();
        while *running.borrow_and_update() {
            if running.changed().await.is_err() {
                break;
            }
        }
    }

    /// Run until stopped, publishing cache snapshots and alerts on `events`.
    pub async fn start_loading(self: Arc<Self>, events: mpsc::UnboundedSender<LoaderEvent>) {
        *self.events.lock().unwrap() = Some(events.clone());
        let _ = self.running_tx.send(true);
        loop {
            let wake = self.wake.notified();
            tokio::pin!(wake);
            wake.as_mut().enable();

            self.run_pass(&events).await;
            if self.stop.is_cancelled() {
                break;
            }
            tokio::select! {
                () = &mut wake => {}
                () = self.stop.cancelled() => break,
            }
        }
        *self.events.lock().unwrap() = None;
        let _ = self.running_tx.send(false);
        debug!("block loader stopped");
    }

    // -----------------------------------------------------------------------
    // Pass mechanics
    // -----------------------------------------------------------------------

    /// Blocks ordered by distance from the active index, nearest first;
    /// lower index wins ties so playback-direction blocks come early.
    fn priority_order(&self) -> Vec<usize> {
        let active = self.active_index.load(Ordering::SeqCst);
        let mut order: Vec<usize> = (0..self.block_count).collect();
        order.sort_by_key(|&i| (i.abs_diff(active), i));
        order
    }

    fn missing_topics(&self, index: usize) -> Vec<String> {
        let topics = self.topics.lock().unwrap();
        let state = self.state.lock().unwrap();
        let slot = &state.slots[index];
        if slot.failed {
            return Vec::new();
        }
        topics
            .iter()
            .filter(|t| !slot.loaded_topics.contains(*t))
            .cloned()
            .collect()
    }

    fn loaded_bytes(&self, state: &LoaderState) -> u64 {
        state
            .slots
            .iter()
            .filter_map(|s| s.block.as_ref())
            .map(|b| b.size_in_bytes)
            .sum()
    }

    /// Retention rank of a block: nearer the active index wins, lower index
    /// wins ties. Eviction always removes the worst-ranked resident, so the
    /// block furthest from the cursor goes first and ties evict the higher
    /// index.
    fn block_priority(&self, index: usize) -> (usize, usize) {
        let active = self.active_index.load(Ordering::SeqCst);
        (index.abs_diff(active), index)
    }

    /// Evict residents ranked below `protect` until the cache fits the
    /// budget. With `reserve_room` the target is strictly under budget (room
    /// for a load about to happen); otherwise at-budget is enough.
    ///
    /// Returns false when the target cannot be reached because every
    /// remaining resident outranks `protect`.
    fn evict_for_budget(&self, state: &mut LoaderState, protect: usize, reserve_room: bool) -> bool {
        let protect_priority = self.block_priority(protect);
        loop {
            let bytes = self.loaded_bytes(state);
            let over = if reserve_room {
                bytes >= self.cache_size_bytes
            } else {
                bytes > self.cache_size_bytes
            };
            if !over {
                return true;
            }
            let candidate = state
                .slots
                .iter()
                .enumerate()
                .filter(|(i, s)| s.block.is_some() && self.block_priority(*i) > protect_priority)
                .max_by_key(|(i, _)| self.block_priority(*i))
                .map(|(i, _)| i);
            let Some(index) = candidate else {
                return false;
            };
            debug!(index, "evicting block");
            state.slots[index].block = None;
            state.slots[index].loaded_topics.clear();
        }
    }

    async fn run_pass(&self, events: &mpsc::UnboundedSender<LoaderEvent>) {
        for index in self.priority_order() {
            if self.stop.is_cancelled() {
                return;
            }
            let missing = self.missing_topics(index);
            if missing.is_empty() {
                continue;
            }
            {
                let mut state = self.state.lock().unwrap();
                if !self.evict_for_budget(&mut state, index, true) {
                    // The budget is held by better-ranked blocks; lower-
                    // ranked ones later in this pass skip the same way.
                    continue;
                }
            }
            match self.load_block(index, &missing).await {
                Ok(()) => {
                    let mut state = self.state.lock().unwrap();
                    self.evict_for_budget(&mut state, index, false);
                    drop(state);
                    let _ = events.send(self.progress_event());
                }
                Err(e) if e.is_abort() => return,
                Err(e) => {
                    warn!(index, error = %e, "block load failed");
                    self.state.lock().unwrap().slots[index].failed = true;
                    let _ = events.send(LoaderEvent::Alert(PlayerAlert::warn(
                        format!("block-load:{index}"),
                        format!("failed to preload block {index}: {e}"),
                    )));
                }
            }
        }
    }

    async fn load_block(&self, index: usize, topics: &[String]) -> Result<(), PlaybackError> {
        let (from, to) = self.block_range(index);
        let mut iterator = self
            .source
            .message_iterator(MessageIteratorArgs {
                topics: topics.to_vec(),
                start: from,
                end: Some(to),
                consumption_type: ConsumptionType::Full,
            })
            .await?;

        let mut by_topic: HashMap<String, Vec<scope_core::MessageEvent>> = topics
            .iter()
            .map(|t| (t.clone(), Vec::new()))
            .collect();
        let mut bytes = 0_u64;
        loop {
            let result = tokio::select! {
                r = iterator.next() => r,
                () = self.stop.cancelled() => {
                    iterator.finish().await;
                    return Err(PlaybackError::Aborted);
                }
            };
            match result {
                None => break,
                Some(Err(e)) => {
                    iterator.finish().await;
                    return Err(e);
                }
                Some(Ok(IteratorResult::Message(m))) => {
                    bytes += m.size_in_bytes;
                    by_topic.entry(m.topic.clone()).or_default().push(m);
                }
                Some(Ok(IteratorResult::Stamp(_))) => {}
                Some(Ok(IteratorResult::Alert(alert))) => {
                    warn!(alert = %alert.message, "alert during block load");
                }
            }
        }
        iterator.finish().await;

        let mut state = self.state.lock().unwrap();
        let slot = &mut state.slots[index];
        let mut merged = Block {
            messages_by_topic: by_topic,
            size_in_bytes: bytes,
        };
        if let Some(existing) = &slot.block {
            for (topic, messages) in &existing.messages_by_topic {
                if !merged.messages_by_topic.contains_key(topic) {
                    merged.size_in_bytes +=
                        messages.iter().map(|m| m.size_in_bytes).sum::<u64>();
                    merged
                        .messages_by_topic
                        .insert(topic.clone(), messages.clone());
                }
            }
        }
        slot.block = Some(Arc::new(merged));
        slot.loaded_topics.extend(topics.iter().cloned());
        Ok(())
    }

    fn progress_event(&self) -> LoaderEvent {
        let topics = self.topics.lock().unwrap().clone();
        let state = self.state.lock().unwrap();
        let blocks: Vec<Option<Arc<Block>>> =
            state.slots.iter().map(|s| s.block.clone()).collect();
        let bytes = self.loaded_bytes(&state);
        let ranges: Vec<FractionRange> = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.failed && topics.iter().all(|t| s.loaded_topics.contains(t)))
            .map(|(i, _)| {
                let (from, to) = self.block_range(i);
                FractionRange::new(
                    from.fraction_between(self.start, self.end),
                    to.fraction_between(self.start, self.end),
                )
            })
            .collect();
        LoaderEvent::Progress {
            message_cache: Arc::new(BlockCache {
                blocks,
                start_time: self.start,
                end_time: self.end,
            }),
            fully_loaded_ranges: merge_ranges(ranges),
            memory_info: HashMap::from([("block-cache".to_owned(), bytes)]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedSource, message};
    use tokio::sync::mpsc::unbounded_channel;

    fn t(sec: i64) -> Time {
        Time { sec, nsec: 0 }
    }

    fn loader_args(cache_size_bytes: u64) -> BlockLoaderArgs {
        BlockLoaderArgs {
            start: t(0),
            end: t(40),
            max_blocks: 4,
            min_block_duration_ns: scope_core::time::NSEC_PER_SEC,
            cache_size_bytes,
        }
    }

    /// One 64-byte message per 10 s block on `/cam`.
    fn block_source() -> Arc<ScriptedSource> {
        Arc::new(
            ScriptedSource::new(t(0), t(40)).with_messages(
                [5, 15, 25, 35].into_iter().map(|s| message("/cam", t(s))),
            ),
        )
    }

    async fn wait_for_ranges(
        rx: &mut mpsc::UnboundedReceiver<LoaderEvent>,
        want: &[FractionRange],
    ) -> Arc<BlockCache> {
        loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .expect("loader event timeout")
                .expect("loader channel closed");
            if let LoaderEvent::Progress {
                fully_loaded_ranges,
                message_cache,
                ..
            } = event
            {
                if fully_loaded_ranges == want {
                    return message_cache;
                }
            }
        }
    }

    #[test]
    fn partitions_span_into_bounded_block_count() {
        let loader = BlockLoader::new(block_source(), loader_args(u64::MAX));
        // 40s / 1s minimum would be 40 blocks; max_blocks caps it at 4.
        assert_eq!(loader.block_count(), 4);
        assert_eq!(loader.block_range(0).0, t(0));
        assert_eq!(loader.block_range(3).1, t(40));
    }

    #[tokio::test]
    async fn loads_all_blocks_and_reports_full_coverage() {
        let loader = BlockLoader::new(block_source(), loader_args(u64::MAX));
        loader.set_topics(["/cam".to_owned()]);
        let (tx, mut rx) = unbounded_channel();
        let task = tokio::spawn(Arc::clone(&loader).start_loading(tx));

        let cache = wait_for_ranges(&mut rx, &[FractionRange::new(0.0, 1.0)]).await;
        assert_eq!(cache.blocks.len(), 4);
        for block in cache.blocks.iter() {
            let block = block.as_ref().expect("block loaded");
            assert_eq!(block.messages_by_topic["/cam"].len(), 1);
        }

        loader.stop_loading().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn failed_block_surfaces_warn_alert_and_loading_continues() {
        let source = Arc::new(
            ScriptedSource::new(t(0), t(40))
                .with_message(message("/ok", t(5)))
                .with_failing_topic("/bad"),
        );
        let loader = BlockLoader::new(source, loader_args(u64::MAX));
        loader.set_topics(["/bad".to_owned()]);
        let (tx, mut rx) = unbounded_channel();
        let task = tokio::spawn(Arc::clone(&loader).start_loading(tx));

        let mut saw_alert = false;
        for _ in 0..4 {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .expect("loader event timeout")
                .expect("loader channel closed");
            if let LoaderEvent::Alert(alert) = event {
                assert_eq!(alert.severity, scope_core::AlertSeverity::Warn);
                saw_alert = true;
            }
        }
        assert!(saw_alert);

        loader.stop_loading().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn eviction_keeps_blocks_near_the_active_index() {
        // Budget fits two 64-byte blocks.
        let loader = BlockLoader::new(block_source(), loader_args(128));
        loader.set_topics(["/cam".to_owned()]);
        let (tx, mut rx) = unbounded_channel();
        let task = tokio::spawn(Arc::clone(&loader).start_loading(tx));

        // First pass with active index 0 loads blocks 0 and 1.
        let cache = wait_for_ranges(&mut rx, &[FractionRange::new(0.0, 0.5)]).await;
        assert!(cache.blocks[0].is_some());
        assert!(cache.blocks[1].is_some());
        assert!(cache.blocks[2].is_none());
        assert!(cache.blocks[3].is_none());

        // Scrub to the end; far blocks load, near-zero blocks evict.
        loader.set_active_time(t(39));
        let cache = wait_for_ranges(&mut rx, &[FractionRange::new(0.5, 1.0)]).await;
        assert!(cache.blocks[0].is_none());
        assert!(cache.blocks[1].is_none());
        assert!(cache.blocks[2].is_some());
        assert!(cache.blocks[3].is_some());

        loader.stop_loading().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn tied_distance_blocks_cannot_overrun_the_budget() {
        // Active in the interior: blocks 0 and 2 tie at distance 1. The
        // budget fits two blocks; the tie must resolve (higher index loses)
        // instead of letting a third block in.
        let loader = BlockLoader::new(block_source(), loader_args(128));
        loader.set_active_time(t(15));
        loader.set_topics(["/cam".to_owned()]);
        let (tx, mut rx) = unbounded_channel();
        let task = tokio::spawn(Arc::clone(&loader).start_loading(tx));

        let cache = wait_for_ranges(&mut rx, &[FractionRange::new(0.0, 0.5)]).await;
        assert!(cache.blocks[0].is_some());
        assert!(cache.blocks[1].is_some());
        assert!(cache.blocks[2].is_none());
        assert!(cache.blocks[3].is_none());
        let resident: u64 = cache
            .blocks
            .iter()
            .flatten()
            .map(|b| b.size_in_bytes)
            .sum();
        assert!(resident <= 128, "cache exceeded its budget: {resident} bytes");

        loader.stop_loading().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn topic_change_retains_surviving_topic_messages() {
        let source = Arc::new(
            ScriptedSource::new(t(0), t(40))
                .with_messages([5, 15, 25, 35].into_iter().map(|s| message("/a", t(s))))
                .with_messages([6, 16, 26, 36].into_iter().map(|s| message("/b", t(s)))),
        );
        let loader = BlockLoader::new(source, loader_args(u64::MAX));
        loader.set_topics(["/a".to_owned(), "/b".to_owned()]);
        let (tx, mut rx) = unbounded_channel();
        let task = tokio::spawn(Arc::clone(&loader).start_loading(tx));

        let cache = wait_for_ranges(&mut rx, &[FractionRange::new(0.0, 1.0)]).await;
        assert!(cache.blocks[0]
            .as_ref()
            .unwrap()
            .messages_by_topic
            .contains_key("/b"));

        // Dropping /b keeps /a data resident and coverage stays complete.
        loader.set_topics(["/a".to_owned()]);
        let cache = wait_for_ranges(&mut rx, &[FractionRange::new(0.0, 1.0)]).await;
        let block = cache.blocks[0].as_ref().unwrap();
        assert!(block.messages_by_topic.contains_key("/a"));
        assert!(!block.messages_by_topic.contains_key("/b"));

        loader.stop_loading().await;
        task.await.unwrap();
    }
}
