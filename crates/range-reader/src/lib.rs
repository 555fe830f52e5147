//! HTTP Range fetcher with a bounded byte cache.
//!
//! Remote log files are read through `Range` requests in fixed-size blocks.
//! Blocks already resident are served without network I/O; concurrent misses
//! for the same block join the in-flight fetch, and adjacent missing blocks
//! coalesce into a single request. Eviction is least-recently-used.
//!
//! No retry policy lives here; callers surface failures.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Fetch granularity. Requests are aligned to this size so cache lookups
/// and in-flight coalescing work on stable keys.
const BLOCK_SIZE: u64 = 1024 * 1024;

/// Default cache capacity; large logs want the full 500 MiB.
pub const DEFAULT_CACHE_CAPACITY: u64 = 500 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RangeReaderError {
    #[error("network error: {0}")]
    Network(String),
    #[error("read aborted")]
    Aborted,
    #[error("reader not opened")]
    NotOpened,
    #[error("read of {length} bytes at {offset} exceeds resource size {size}")]
    OutOfBounds { offset: u64, length: u64, size: u64 },
}

// ---------------------------------------------------------------------------
// Block cache
// ---------------------------------------------------------------------------

struct CachedBlock {
    data: Arc<[u8]>,
    /// Recency tick; larger is more recent.
    touched: u64,
}

/// LRU cache of fetched blocks, keyed by block index.
///
/// Kept separate from the reader so the policy is testable without I/O.
struct ByteCache {
    blocks: HashMap<u64, CachedBlock>,
    capacity_bytes: u64,
    current_bytes: u64,
    clock: u64,
}

impl ByteCache {
    fn new(capacity_bytes: u64) -> Self {
        ByteCache {
            blocks: HashMap::new(),
            capacity_bytes,
            current_bytes: 0,
            clock: 0,
        }
    }

    fn get(&mut self, index: u64) -> Option<Arc<[u8]>> {
        self.clock += 1;
        let clock = self.clock;
        self.blocks.get_mut(&index).map(|b| {
            b.touched = clock;
            Arc::clone(&b.data)
        })
    }

    fn insert(&mut self, index: u64, data: Arc<[u8]>) {
        self.clock += 1;
        self.current_bytes += data.len() as u64;
        let prev = self.blocks.insert(
            index,
            CachedBlock {
                data,
                touched: self.clock,
            },
        );
        if let Some(prev) = prev {
            self.current_bytes -= prev.data.len() as u64;
        }
        while self.current_bytes > self.capacity_bytes && self.blocks.len() > 1 {
            let oldest = self
                .blocks
                .iter()
                .min_by_key(|(_, b)| b.touched)
                .map(|(idx, _)| *idx);
            if let Some(idx) = oldest {
                if let Some(evicted) = self.blocks.remove(&idx) {
                    self.current_bytes -= evicted.data.len() as u64;
                }
            }
        }
    }

    fn size_bytes(&self) -> u64 {
        self.current_bytes
    }
}

// ---------------------------------------------------------------------------
// RangeReader
// ---------------------------------------------------------------------------

struct ReaderState {
    cache: ByteCache,
    /// Blocks currently being fetched. Waiters park on the Notify and
    /// re-check the cache when it fires.
    in_flight: HashMap<u64, Arc<Notify>>,
}

/// A remote resource readable at arbitrary offsets via HTTP `Range`.
pub struct RangeReader {
    url: String,
    http: reqwest::Client,
    size: std::sync::atomic::AtomicU64,
    opened: std::sync::atomic::AtomicBool,
    state: Mutex<ReaderState>,
}

impl RangeReader {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_capacity(url, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(url: impl Into<String>, cache_capacity_bytes: u64) -> Self {
        RangeReader {
            url: url.into(),
            http: reqwest::Client::new(),
            size: std::sync::atomic::AtomicU64::new(0),
            opened: std::sync::atomic::AtomicBool::new(false),
            state: Mutex::new(ReaderState {
                cache: ByteCache::new(cache_capacity_bytes.max(BLOCK_SIZE)),
                in_flight: HashMap::new(),
            }),
        }
    }

    /// HEAD the resource to learn its size. Must be called before `read`.
    pub async fn open(&self) -> Result<u64, RangeReaderError> {
        let response = self
            .http
            .head(&self.url)
            .send()
            .await
            .map_err(|e| RangeReaderError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RangeReaderError::Network(format!(
                "HEAD {} returned {}",
                self.url,
                response.status()
            )));
        }
        let size = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                RangeReaderError::Network(format!("HEAD {} missing Content-Length", self.url))
            })?;
        if response
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)
            .is_none()
        {
            warn!(url = %self.url, "server did not advertise Accept-Ranges");
        }
        self.size.store(size, std::sync::atomic::Ordering::SeqCst);
        self.opened.store(true, std::sync::atomic::Ordering::SeqCst);
        debug!(url = %self.url, size, "remote resource opened");
        Ok(size)
    }

    pub fn size(&self) -> u64 {
        self.size.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Bytes currently resident in the cache.
    pub async fn cache_size_bytes(&self) -> u64 {
        self.state.lock().await.cache.size_bytes()
    }

    /// Read `length` bytes at `offset`, from cache where possible.
    pub async fn read(
        &self,
        offset: u64,
        length: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, RangeReaderError> {
        if !self.opened.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RangeReaderError::NotOpened);
        }
        let size = self.size();
        if offset + length > size {
            return Err(RangeReaderError::OutOfBounds {
                offset,
                length,
                size,
            });
        }
        if length == 0 {
            return Ok(Vec::new());
        }

        let first_block = offset / BLOCK_SIZE;
        let last_block = (offset + length - 1) / BLOCK_SIZE;
        let mut out = Vec::with_capacity(length as usize);

        for index in first_block..=last_block {
            let block = self.block(index, cancel).await?;
            let block_start = index * BLOCK_SIZE;
            let from = offset.saturating_sub(block_start) as usize;
            let to = std::cmp::min(
                block.len() as u64,
                (offset + length).saturating_sub(block_start),
            ) as usize;
            out.extend_from_slice(&block[from..to]);
        }
        Ok(out)
    }

    /// Return one block, fetching (and coalescing with adjacent misses) on demand.
    async fn block(
        &self,
        index: u64,
        cancel: &CancellationToken,
    ) -> Result<Arc<[u8]>, RangeReaderError> {
        loop {
            if cancel.is_cancelled() {
                return Err(RangeReaderError::Aborted);
            }
            let (run, notify) = {
                let mut state = self.state.lock().await;
                if let Some(data) = state.cache.get(index) {
                    return Ok(data);
                }
                if let Some(pending) = state.in_flight.get(&index) {
                    // Another caller is already fetching this block.
                    let pending = Arc::clone(pending);
                    drop(state);
                    tokio::select! {
                        () = pending.notified() => continue,
                        () = cancel.cancelled() => return Err(RangeReaderError::Aborted),
                    }
                }
                // Coalesce the miss with adjacent blocks that are neither
                // cached nor already being fetched.
                let run = self.missing_run(&mut state, index);
                let notify = Arc::new(Notify::new());
                for i in run.clone() {
                    state.in_flight.insert(i, Arc::clone(&notify));
                }
                (run, notify)
            };

            let result = tokio::select! {
                r = self.fetch_blocks(run.clone()) => r,
                () = cancel.cancelled() => Err(RangeReaderError::Aborted),
            };

            let mut state = self.state.lock().await;
            for i in run.clone() {
                state.in_flight.remove(&i);
            }
            match result {
                Ok(blocks) => {
                    let mut wanted = None;
                    for (i, data) in run.zip(blocks) {
                        if i == index {
                            wanted = Some(Arc::clone(&data));
                        }
                        state.cache.insert(i, data);
                    }
                    notify.notify_waiters();
                    if let Some(data) = wanted {
                        return Ok(data);
                    }
                }
                Err(e) => {
                    notify.notify_waiters();
                    return Err(e);
                }
            }
        }
    }

    fn missing_run(
        &self,
        state: &mut tokio::sync::MutexGuard<'_, ReaderState>,
        index: u64,
    ) -> std::ops::Range<u64> {
        let total_blocks = self.size().div_ceil(BLOCK_SIZE);
        let mut end = index + 1;
        while end < total_blocks
            && !state.in_flight.contains_key(&end)
            && state.cache.get(end).is_none()
        {
            end += 1;
        }
        index..end
    }

    /// One ranged GET covering `run`, split back into blocks.
    async fn fetch_blocks(
        &self,
        run: std::ops::Range<u64>,
    ) -> Result<Vec<Arc<[u8]>>, RangeReaderError> {
        let start = run.start * BLOCK_SIZE;
        let end = std::cmp::min(run.end * BLOCK_SIZE, self.size());
        debug!(url = %self.url, start, end, "range fetch");

        let response = self
            .http
            .get(&self.url)
            .header(reqwest::header::RANGE, format!("bytes={}-{}", start, end - 1))
            .send()
            .await
            .map_err(|e| RangeReaderError::Network(e.to_string()))?;
        let status = response.status();
        if !(status == reqwest::StatusCode::PARTIAL_CONTENT || status.is_success()) {
            return Err(RangeReaderError::Network(format!(
                "GET {} range {}-{} returned {}",
                self.url,
                start,
                end - 1,
                status
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| RangeReaderError::Network(e.to_string()))?;
        if body.len() as u64 != end - start {
            return Err(RangeReaderError::Network(format!(
                "range response length {} != requested {}",
                body.len(),
                end - start
            )));
        }

        let mut blocks = Vec::with_capacity(run.clone().count());
        for i in run {
            let from = (i * BLOCK_SIZE - start) as usize;
            let to = std::cmp::min(((i + 1) * BLOCK_SIZE - start) as usize, body.len());
            blocks.push(Arc::from(&body[from..to]));
        }
        Ok(blocks)
    }
}
