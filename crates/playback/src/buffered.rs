//! Forward prefetch over an underlying source.
//!
//! Each iterator spawns a producer task that reads ahead of the consumer
//! into a time-indexed queue, bounded by `read_ahead` nanoseconds past the
//! consumer's last observed time. The producer suspends when the window is
//! full; the consumer parks at the buffer tip until the producer catches up.
//!
//! Multiple iterators may be open at once (playback cursor and block
//! preloading read independently); residency across all of them is reported
//! through `loaded_ranges`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use scope_core::{FractionRange, IteratorResult, MessageEvent, Time, merge_ranges};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::source::{
    BackfillArgs, Initialization, MessageIterator, MessageIteratorArgs, MessageSource,
};
use crate::{DEFAULT_READ_AHEAD_NANOS, PlaybackError};

// ---------------------------------------------------------------------------
// Ring buffer shared between one producer and one consumer
// ---------------------------------------------------------------------------

struct RingState {
    queue: VecDeque<IteratorResult>,
    bytes: u64,
    consumer_time: Time,
    buffered_through: Time,
    done: bool,
    failed: Option<PlaybackError>,
}

struct Ring {
    state: Mutex<RingState>,
    produced: Notify,
    consumed: Notify,
    cancel: CancellationToken,
}

impl Ring {
    fn new(start: Time, cancel: CancellationToken) -> Self {
        Ring {
            state: Mutex::new(RingState {
                queue: VecDeque::new(),
                bytes: 0,
                consumer_time: start,
                buffered_through: start,
                done: false,
                failed: None,
            }),
            produced: Notify::new(),
            consumed: Notify::new(),
            cancel,
        }
    }
}

fn result_time(result: &IteratorResult) -> Option<Time> {
    match result {
        IteratorResult::Message(m) => Some(m.receive_time),
        IteratorResult::Stamp(t) => Some(*t),
        IteratorResult::Alert(_) => None,
    }
}

fn result_bytes(result: &IteratorResult) -> u64 {
    match result {
        IteratorResult::Message(m) => m.size_in_bytes,
        _ => 0,
    }
}

// ---------------------------------------------------------------------------
// Shared residency bookkeeping
// ---------------------------------------------------------------------------

struct Shared {
    bounds: Mutex<Option<(Time, Time)>>,
    rings: Mutex<Vec<Arc<Ring>>>,
    ranges_tx: watch::Sender<Vec<FractionRange>>,
}

impl Shared {
    /// Recompute normalized residency and publish when it changed.
    fn update_ranges(&self) {
        let Some((start, end)) = *self.bounds.lock().unwrap() else {
            return;
        };
        let ranges: Vec<FractionRange> = {
            let rings = self.rings.lock().unwrap();
            rings
                .iter()
                .map(|ring| {
                    let state = ring.state.lock().unwrap();
                    FractionRange::new(
                        state.consumer_time.fraction_between(start, end),
                        state.buffered_through.fraction_between(start, end),
                    )
                })
                .collect()
        };
        let merged = merge_ranges(ranges);
        self.ranges_tx.send_if_modified(|current| {
            if *current == merged {
                false
            } else {
                *current = merged;
                true
            }
        });
    }

    fn drop_ring(&self, ring: &Arc<Ring>) {
        let mut rings = self.rings.lock().unwrap();
        rings.retain(|r| !Arc::ptr_eq(r, ring));
    }
}

// ---------------------------------------------------------------------------
// BufferedSource
// ---------------------------------------------------------------------------

/// Wraps a source with a bounded forward prefetch window.
pub struct BufferedSource {
    inner: Arc<dyn MessageSource>,
    read_ahead_nanos: i64,
    shared: Arc<Shared>,
    terminated: CancellationToken,
}

impl BufferedSource {
    pub fn new(inner: Arc<dyn MessageSource>) -> Self {
        Self::with_read_ahead(inner, DEFAULT_READ_AHEAD_NANOS)
    }

    pub fn with_read_ahead(inner: Arc<dyn MessageSource>, read_ahead_nanos: i64) -> Self {
        let (ranges_tx, _) = watch::channel(Vec::new());
        BufferedSource {
            inner,
            read_ahead_nanos,
            shared: Arc::new(Shared {
                bounds: Mutex::new(None),
                rings: Mutex::new(Vec::new()),
                ranges_tx,
            }),
            terminated: CancellationToken::new(),
        }
    }

    /// Normalized fractions of the log currently buffered.
    pub fn loaded_ranges(&self) -> Vec<FractionRange> {
        self.shared.ranges_tx.borrow().clone()
    }

    /// Observe residency changes (`loadedRangesChange`).
    pub fn loaded_ranges_watch(&self) -> watch::Receiver<Vec<FractionRange>> {
        self.shared.ranges_tx.subscribe()
    }

    /// Bytes resident across all open iterators.
    pub fn cache_size_bytes(&self) -> u64 {
        let rings = self.shared.rings.lock().unwrap();
        rings
            .iter()
            .map(|ring| ring.state.lock().unwrap().bytes)
            .sum()
    }
}

#[async_trait]
impl MessageSource for BufferedSource {
    async fn initialize(&self) -> Result<Initialization, PlaybackError> {
        let init = self.inner.initialize().await?;
        *self.shared.bounds.lock().unwrap() = Some((init.start, init.end));
        Ok(init)
    }

    async fn message_iterator(
        &self,
        args: MessageIteratorArgs,
    ) -> Result<Box<dyn MessageIterator>, PlaybackError> {
        if self.terminated.is_cancelled() {
            return Err(PlaybackError::Aborted);
        }
        let inner_iter = self.inner.message_iterator(args.clone()).await?;
        let cancel = self.terminated.child_token();
        let ring = Arc::new(Ring::new(args.start, cancel));
        self.shared.rings.lock().unwrap().push(Arc::clone(&ring));

        let producer_ring = Arc::clone(&ring);
        let producer_shared = Arc::clone(&self.shared);
        let read_ahead = self.read_ahead_nanos;
        tokio::spawn(async move {
            run_producer(producer_ring, producer_shared, inner_iter, read_ahead).await;
        });

        Ok(Box::new(BufferedIterator {
            ring,
            shared: Arc::clone(&self.shared),
            finished: false,
        }))
    }

    async fn get_backfill_messages(
        &self,
        args: BackfillArgs,
    ) -> Result<Vec<MessageEvent>, PlaybackError> {
        self.inner.get_backfill_messages(args).await
    }

    async fn terminate(&self) {
        self.terminated.cancel();
        let rings: Vec<Arc<Ring>> = self.shared.rings.lock().unwrap().drain(..).collect();
        for ring in rings {
            ring.produced.notify_waiters();
            ring.consumed.notify_waiters();
        }
        self.inner.terminate().await;
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

async fn run_producer(
    ring: Arc<Ring>,
    shared: Arc<Shared>,
    mut inner: Box<dyn MessageIterator>,
    read_ahead_nanos: i64,
) {
    'outer: loop {
        // Back-pressure: suspend while the window ahead of the consumer is full.
        loop {
            let notified = ring.consumed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let window_full = {
                let state = ring.state.lock().unwrap();
                !state.queue.is_empty()
                    && state.buffered_through.nanos_since(state.consumer_time) >= read_ahead_nanos
            };
            if !window_full {
                break;
            }
            tokio::select! {
                () = &mut notified => {}
                () = ring.cancel.cancelled() => break 'outer,
            }
        }

        let result = tokio::select! {
            r = inner.next() => r,
            () = ring.cancel.cancelled() => break 'outer,
        };
        match result {
            None => {
                ring.state.lock().unwrap().done = true;
                ring.produced.notify_waiters();
                break;
            }
            Some(Err(e)) => {
                let mut state = ring.state.lock().unwrap();
                state.failed = Some(e);
                state.done = true;
                drop(state);
                ring.produced.notify_waiters();
                break;
            }
            Some(Ok(result)) => {
                let mut state = ring.state.lock().unwrap();
                state.bytes += result_bytes(&result);
                if let Some(t) = result_time(&result) {
                    if t > state.buffered_through {
                        state.buffered_through = t;
                    }
                }
                state.queue.push_back(result);
                drop(state);
                ring.produced.notify_waiters();
                shared.update_ranges();
            }
        }
    }
    debug!("buffered producer finished");
    inner.finish().await;
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

struct BufferedIterator {
    ring: Arc<Ring>,
    shared: Arc<Shared>,
    finished: bool,
}

#[async_trait]
impl MessageIterator for BufferedIterator {
    async fn next(&mut self) -> Option<Result<IteratorResult, PlaybackError>> {
        loop {
            let notified = self.ring.produced.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.ring.state.lock().unwrap();
                if let Some(result) = state.queue.pop_front() {
                    state.bytes = state.bytes.saturating_sub(result_bytes(&result));
                    if let Some(t) = result_time(&result) {
                        if t > state.consumer_time {
                            state.consumer_time = t;
                        }
                    }
                    drop(state);
                    self.ring.consumed.notify_waiters();
                    self.shared.update_ranges();
                    return Some(Ok(result));
                }
                if let Some(failed) = state.failed.take() {
                    return Some(Err(failed));
                }
                if state.done {
                    return None;
                }
            }
            tokio::select! {
                () = &mut notified => {}
                () = self.ring.cancel.cancelled() => return Some(Err(PlaybackError::Aborted)),
            }
        }
    }

    async fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.ring.cancel.cancel();
        self.ring.consumed.notify_waiters();
        self.shared.drop_ring(&self.ring);
        self.shared.update_ranges();
    }
}

impl Drop for BufferedIterator {
    fn drop(&mut self) {
        if !self.finished {
            self.ring.cancel.cancel();
            self.ring.consumed.notify_waiters();
            self.shared.drop_ring(&self.ring);
        }
    }
}
