//! Decode adapter over a serialized-payload source.
//!
//! A pool of worker tasks owns the decoder state; bytes cross the channel
//! boundary in, decoded values come back. Each iterator pins to one worker
//! so per-iterator ordering is preserved. Batches are clock-bounded to stay
//! within one frame rather than count-bounded.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use scope_core::{IteratorResult, MessageEvent, MessagePayload, PlayerAlert};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant, timeout_at};
use tracing::warn;

use crate::source::{
    BackfillArgs, Initialization, MessageIterator, MessageIteratorArgs, MessageSource,
};
use crate::{DESERIALIZE_BATCH_MS, PlaybackError};

const DEFAULT_WORKER_COUNT: usize = 3;
const WORKER_QUEUE_DEPTH: usize = 4;

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Per-worker decode state, constructed once from the initialization
/// snapshot. The suite's message profile is JSON; schema names are kept for
/// diagnostics only.
struct Decoder {
    _init: Arc<Initialization>,
}

impl Decoder {
    fn new(init: Arc<Initialization>) -> Self {
        Decoder { _init: init }
    }

    fn decode(&self, event: MessageEvent) -> IteratorResult {
        match &event.message {
            MessagePayload::Decoded(_) => IteratorResult::Message(event),
            MessagePayload::Serialized(bytes) => {
                match serde_json::from_slice::<serde_json::Value>(bytes) {
                    Ok(value) => IteratorResult::Message(MessageEvent {
                        message: MessagePayload::Decoded(Arc::new(value)),
                        ..event
                    }),
                    Err(e) => IteratorResult::Alert(PlayerAlert::warn(
                        format!("decode:{}", event.topic),
                        format!(
                            "failed to decode message on {} ({}): {}",
                            event.topic, event.schema_name, e
                        ),
                    )),
                }
            }
        }
    }
}

struct DecodeRequest {
    events: Vec<MessageEvent>,
    reply: oneshot::Sender<Vec<IteratorResult>>,
}

async fn run_worker(init: Arc<Initialization>, mut rx: mpsc::Receiver<DecodeRequest>) {
    let decoder = Decoder::new(init);
    while let Some(request) = rx.recv().await {
        let outcomes = request
            .events
            .into_iter()
            .map(|event| decoder.decode(event))
            .collect();
        let _ = request.reply.send(outcomes);
    }
}

// ---------------------------------------------------------------------------
// DeserializingSource
// ---------------------------------------------------------------------------

/// Adapts a serialized-message source to a decoded one.
pub struct DeserializingSource {
    inner: Arc<dyn MessageSource>,
    worker_count: usize,
    workers: std::sync::Mutex<Vec<mpsc::Sender<DecodeRequest>>>,
    next_worker: AtomicUsize,
}

impl DeserializingSource {
    pub fn new(inner: Arc<dyn MessageSource>) -> Self {
        Self::with_workers(inner, DEFAULT_WORKER_COUNT)
    }

    pub fn with_workers(inner: Arc<dyn MessageSource>, worker_count: usize) -> Self {
        DeserializingSource {
            inner,
            worker_count: worker_count.max(1),
            workers: std::sync::Mutex::new(Vec::new()),
            next_worker: AtomicUsize::new(0),
        }
    }

    fn pin_worker(&self) -> Result<mpsc::Sender<DecodeRequest>, PlaybackError> {
        let workers = self.workers.lock().unwrap();
        if workers.is_empty() {
            return Err(PlaybackError::Invariant(
                "deserializing source used before initialize".to_owned(),
            ));
        }
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % workers.len();
        Ok(workers[index].clone())
    }
}

async fn decode_batch(
    worker: &mpsc::Sender<DecodeRequest>,
    events: Vec<MessageEvent>,
) -> Result<Vec<IteratorResult>, PlaybackError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    worker
        .send(DecodeRequest {
            events,
            reply: reply_tx,
        })
        .await
        .map_err(|_| PlaybackError::Aborted)?;
    reply_rx.await.map_err(|_| PlaybackError::Aborted)
}

#[async_trait]
impl MessageSource for DeserializingSource {
    async fn initialize(&self) -> Result<Initialization, PlaybackError> {
        let init = self.inner.initialize().await?;
        let snapshot = Arc::new(init.clone());
        let mut workers = self.workers.lock().unwrap();
        if workers.is_empty() {
            for _ in 0..self.worker_count {
                let (tx, rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
                tokio::spawn(run_worker(Arc::clone(&snapshot), rx));
                workers.push(tx);
            }
        }
        Ok(init)
    }

    async fn message_iterator(
        &self,
        args: MessageIteratorArgs,
    ) -> Result<Box<dyn MessageIterator>, PlaybackError> {
        let worker = self.pin_worker()?;
        let inner = self.inner.message_iterator(args).await?;
        Ok(Box::new(DeserializingIterator {
            inner,
            worker,
            pending: std::collections::VecDeque::new(),
            pending_error: None,
            done: false,
        }))
    }

    async fn get_backfill_messages(
        &self,
        args: BackfillArgs,
    ) -> Result<Vec<MessageEvent>, PlaybackError> {
        let worker = self.pin_worker()?;
        let events = self.inner.get_backfill_messages(args).await?;
        let outcomes = decode_batch(&worker, events).await?;
        let mut out = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                IteratorResult::Message(m) => out.push(m),
                IteratorResult::Alert(alert) => {
                    warn!(alert = %alert.message, "dropping undecodable backfill message");
                }
                IteratorResult::Stamp(_) => {}
            }
        }
        Ok(out)
    }

    async fn terminate(&self) {
        self.workers.lock().unwrap().clear();
        self.inner.terminate().await;
    }
}

// ---------------------------------------------------------------------------
// Iterator
// ---------------------------------------------------------------------------

struct DeserializingIterator {
    inner: Box<dyn MessageIterator>,
    worker: mpsc::Sender<DecodeRequest>,
    pending: std::collections::VecDeque<IteratorResult>,
    pending_error: Option<PlaybackError>,
    done: bool,
}

impl DeserializingIterator {
    /// Pull one result, then keep batching until the frame budget elapses or
    /// a non-message result flushes the batch.
    async fn fill_pending(&mut self) -> Result<(), PlaybackError> {
        let mut batch: Vec<MessageEvent> = Vec::new();
        let mut tail: Option<IteratorResult> = None;

        match self.inner.next().await {
            None => self.done = true,
            Some(Err(e)) => {
                self.done = true;
                self.pending_error = Some(e);
            }
            Some(Ok(IteratorResult::Message(m))) => batch.push(m),
            Some(Ok(other)) => tail = Some(other),
        }

        if !batch.is_empty() {
            let deadline = Instant::now() + Duration::from_millis(DESERIALIZE_BATCH_MS);
            loop {
                match timeout_at(deadline, self.inner.next()).await {
                    Err(_) => break,
                    Ok(None) => {
                        self.done = true;
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        self.done = true;
                        self.pending_error = Some(e);
                        break;
                    }
                    Ok(Some(Ok(IteratorResult::Message(m)))) => batch.push(m),
                    Ok(Some(Ok(other))) => {
                        tail = Some(other);
                        break;
                    }
                }
            }
            let outcomes = decode_batch(&self.worker, batch).await?;
            self.pending.extend(outcomes);
        }

        if let Some(tail) = tail {
            self.pending.push_back(tail);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageIterator for DeserializingIterator {
    async fn next(&mut self) -> Option<Result<IteratorResult, PlaybackError>> {
        loop {
            if let Some(result) = self.pending.pop_front() {
                return Some(Ok(result));
            }
            if let Some(e) = self.pending_error.take() {
                return Some(Err(e));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.fill_pending().await {
                return Some(Err(e));
            }
        }
    }

    async fn finish(&mut self) {
        self.inner.finish().await;
    }
}
