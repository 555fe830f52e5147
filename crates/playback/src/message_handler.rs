//! Forward playback iterator ownership.
//!
//! Three operations drive the cursor: `read_initial` primes the head of the
//! log, `read_backfill` repositions after a seek, and `tick` drains the
//! iterator through a target time. A message read past the tick boundary is
//! carried to the next tick; a stamp at or past the boundary short-circuits
//! ticks that stay inside its coverage.

use std::sync::Arc;

use scope_core::{IteratorResult, MessageEvent, PlayerAlert, Time};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::source::{ConsumptionType, MessageIterator, MessageIteratorArgs, MessageSource};
use crate::{PlaybackError, SEEK_ON_START_NS};

/// Output of one drain operation.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub messages: Vec<MessageEvent>,
    pub alerts: Vec<PlayerAlert>,
    /// True when the iterator ran out before the target time.
    pub reached_end: bool,
}

pub struct MessageHandler {
    source: Arc<dyn MessageSource>,
    topics: Vec<String>,
    start: Time,
    end: Time,
    iterator: Option<Box<dyn MessageIterator>>,
    /// Message read past the last tick boundary, owed to a future tick.
    last_message: Option<MessageEvent>,
    /// Stamp covering a messageless region at or past the last boundary.
    last_stamp: Option<Time>,
    /// Results accumulated by an in-flight drain. Kept on the handler so a
    /// cancelled tick does not lose messages already pulled from the
    /// iterator; the next tick flushes them first.
    partial: Vec<MessageEvent>,
    partial_alerts: Vec<PlayerAlert>,
    current_time: Time,
}

impl MessageHandler {
    pub fn new(source: Arc<dyn MessageSource>, start: Time, end: Time) -> Self {
        MessageHandler {
            source,
            topics: Vec::new(),
            start,
            end,
            iterator: None,
            last_message: None,
            last_stamp: None,
            partial: Vec::new(),
            partial_alerts: Vec::new(),
            current_time: start,
        }
    }

    pub fn current_time(&self) -> Time {
        self.current_time
    }

    pub fn set_topics(&mut self, topics: Vec<String>) {
        self.topics = topics;
    }

    fn forward_args(&self, start: Time) -> MessageIteratorArgs {
        MessageIteratorArgs {
            topics: self.topics.clone(),
            start,
            end: None,
            consumption_type: ConsumptionType::Partial,
        }
    }

    /// Open the iterator at the head of the log and drain up to
    /// `start + SEEK_ON_START_NS` so the first emission is small.
    pub async fn read_initial(&mut self) -> Result<TickOutcome, PlaybackError> {
        let boundary = self.start.add_nanos(SEEK_ON_START_NS).clamp_to(self.start, self.end);
        self.close_iterator().await;
        let mut iterator = self.source.message_iterator(self.forward_args(self.start)).await?;

        let mut outcome = TickOutcome::default();
        loop {
            match iterator.next().await {
                None => {
                    outcome.reached_end = true;
                    break;
                }
                Some(Err(e)) => {
                    iterator.finish().await;
                    return Err(e);
                }
                Some(Ok(IteratorResult::Stamp(t))) => {
                    if t >= boundary {
                        self.last_stamp = Some(t);
                        break;
                    }
                }
                Some(Ok(IteratorResult::Message(m))) => {
                    if m.receive_time <= boundary {
                        outcome.messages.push(m);
                    } else {
                        self.last_message = Some(m);
                        break;
                    }
                }
                Some(Ok(IteratorResult::Alert(alert))) => outcome.alerts.push(alert),
            }
        }
        self.iterator = Some(iterator);
        self.current_time = boundary;
        Ok(outcome)
    }

    /// Fetch the most recent message per subscribed topic at or before
    /// `target`, repositioning the cursor there.
    pub async fn read_backfill(
        &mut self,
        target: Time,
        cancel: CancellationToken,
    ) -> Result<Vec<MessageEvent>, PlaybackError> {
        let mut messages = self
            .source
            .get_backfill_messages(crate::source::BackfillArgs {
                topics: self.topics.clone(),
                time: target,
                cancel,
            })
            .await?;
        messages.sort_by_key(|m| m.receive_time);
        self.last_message = None;
        self.last_stamp = None;
        self.partial.clear();
        self.partial_alerts.clear();
        self.current_time = target;
        Ok(messages)
    }

    /// Drain the forward iterator up to and including `end_time`.
    ///
    /// Results accumulate on `self` until the drain finishes, so a tick
    /// cancelled at an await point leaves its half-read batch for the next
    /// tick instead of dropping it.
    pub async fn tick(&mut self, end_time: Time) -> Result<TickOutcome, PlaybackError> {
        let mut reached_end = false;
        let mut skip_drain = false;

        if let Some(m) = self.last_message.take() {
            if m.receive_time <= end_time {
                self.partial.push(m);
            } else {
                // Not due yet. The iterator is time-ordered, so the carried
                // message also proves nothing else lands in this tick.
                self.last_message = Some(m);
                skip_drain = true;
            }
        }

        let covered = self.last_stamp.is_some_and(|s| s >= end_time);
        if !skip_drain && !covered {
            self.last_stamp = None;
            let Some(iterator) = self.iterator.as_mut() else {
                return Err(PlaybackError::Invariant(
                    "tick before the playback iterator was opened".to_owned(),
                ));
            };
            loop {
                match iterator.next().await {
                    None => {
                        reached_end = true;
                        break;
                    }
                    Some(Err(e)) => return Err(e),
                    Some(Ok(IteratorResult::Stamp(t))) => {
                        if t >= end_time {
                            self.last_stamp = Some(t);
                            break;
                        }
                    }
                    Some(Ok(IteratorResult::Message(m))) => {
                        if m.receive_time <= end_time {
                            self.partial.push(m);
                        } else {
                            self.last_message = Some(m);
                            break;
                        }
                    }
                    Some(Ok(IteratorResult::Alert(alert))) => self.partial_alerts.push(alert),
                }
            }
        }

        self.current_time = end_time;
        Ok(TickOutcome {
            messages: std::mem::take(&mut self.partial),
            alerts: std::mem::take(&mut self.partial_alerts),
            reached_end,
        })
    }

    /// Close and reopen the iterator just past the cursor.
    ///
    /// Opening at exactly `start` (rather than `start + 1ns`) preserves
    /// boundary messages when nothing has been consumed yet.
    pub async fn reset_playback_iterator(&mut self) -> Result<(), PlaybackError> {
        self.close_iterator().await;
        let open_at = if self.current_time == self.start {
            self.start
        } else {
            self.current_time.add_nanos(1)
        };
        debug!(%open_at, "reopening playback iterator");
        self.iterator = Some(self.source.message_iterator(self.forward_args(open_at)).await?);
        // The reopened iterator re-reads everything past the cursor, so any
        // half-read state would turn into duplicates.
        self.last_message = None;
        self.last_stamp = None;
        self.partial.clear();
        self.partial_alerts.clear();
        Ok(())
    }

    pub async fn close_iterator(&mut self) {
        if let Some(mut iterator) = self.iterator.take() {
            iterator.finish().await;
        }
    }
}
