//! Scripted in-memory sources for exercising the engine without real logs.
//!
//! Compiled for this crate's own tests and, via the `test-support` feature,
//! for downstream harnesses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scope_core::{
    IteratorResult, MessageEvent, MessagePayload, Time, Topic, TopicStats,
};

use crate::source::{
    BackfillArgs, ConsumptionType, Initialization, MessageIterator, MessageIteratorArgs,
    MessageSource,
};
use crate::PlaybackError;

/// Build a decoded message event for tests.
pub fn message(topic: &str, time: Time) -> MessageEvent {
    MessageEvent {
        topic: topic.to_owned(),
        receive_time: time,
        message: MessagePayload::Decoded(Arc::new(serde_json::json!({ "t": topic }))),
        schema_name: format!("{}_schema", topic.trim_start_matches('/')),
        size_in_bytes: 64,
    }
}

/// Build a serialized (JSON bytes) message event for tests.
pub fn serialized_message(topic: &str, time: Time, body: &serde_json::Value) -> MessageEvent {
    let bytes = serde_json::to_vec(body).expect("serialize test payload");
    MessageEvent {
        topic: topic.to_owned(),
        receive_time: time,
        message: MessagePayload::Serialized(Arc::from(bytes.as_slice())),
        schema_name: format!("{}_schema", topic.trim_start_matches('/')),
        size_in_bytes: 64,
    }
}

/// An in-memory source playing back a fixed script of messages.
pub struct ScriptedSource {
    start: Time,
    end: Time,
    events: Vec<MessageEvent>,
    /// Topics whose iterators fail immediately; exercises failure paths.
    failing_topics: Vec<String>,
    /// Optional artificial latency per `next` call.
    next_delay: Option<Duration>,
    profile: Option<String>,
}

impl ScriptedSource {
    pub fn new(start: Time, end: Time) -> Self {
        ScriptedSource {
            start,
            end,
            events: Vec::new(),
            failing_topics: Vec::new(),
            next_delay: None,
            profile: None,
        }
    }

    pub fn with_message(mut self, event: MessageEvent) -> Self {
        self.events.push(event);
        self.events.sort_by_key(|e| e.receive_time);
        self
    }

    pub fn with_messages(mut self, events: impl IntoIterator<Item = MessageEvent>) -> Self {
        self.events.extend(events);
        self.events.sort_by_key(|e| e.receive_time);
        self
    }

    pub fn with_failing_topic(mut self, topic: impl Into<String>) -> Self {
        self.failing_topics.push(topic.into());
        self
    }

    pub fn with_next_delay(mut self, delay: Duration) -> Self {
        self.next_delay = Some(delay);
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    fn topics(&self) -> Vec<Topic> {
        let mut seen = Vec::new();
        for event in &self.events {
            if !seen.iter().any(|t: &Topic| t.name == event.topic) {
                seen.push(Topic::new(event.topic.clone(), Some(&event.schema_name)));
            }
        }
        seen
    }

    fn topic_stats(&self) -> HashMap<String, TopicStats> {
        let mut stats: HashMap<String, TopicStats> = HashMap::new();
        for event in &self.events {
            let entry = stats.entry(event.topic.clone()).or_default();
            entry.num_messages += 1;
            if entry.first_message_time.is_none() {
                entry.first_message_time = Some(event.receive_time);
            }
            entry.last_message_time = Some(event.receive_time);
        }
        stats
    }
}

#[async_trait]
impl MessageSource for ScriptedSource {
    async fn initialize(&self) -> Result<Initialization, PlaybackError> {
        Ok(Initialization {
            start: self.start,
            end: self.end,
            topics: self.topics(),
            topic_stats: self.topic_stats(),
            profile: self.profile.clone(),
            ..Initialization::default()
        })
    }

    async fn message_iterator(
        &self,
        args: MessageIteratorArgs,
    ) -> Result<Box<dyn MessageIterator>, PlaybackError> {
        if let Some(bad) = self
            .failing_topics
            .iter()
            .find(|t| args.topics.contains(t))
        {
            return Err(PlaybackError::Network(format!(
                "scripted failure reading {}",
                bad
            )));
        }
        let end = args.end.unwrap_or(self.end);
        let results: Vec<IteratorResult> = self
            .events
            .iter()
            .filter(|e| {
                args.topics.contains(&e.topic)
                    && e.receive_time >= args.start
                    && e.receive_time <= end
            })
            .cloned()
            .map(IteratorResult::Message)
            .chain(std::iter::once(IteratorResult::Stamp(end)))
            .collect();
        Ok(Box::new(ScriptedIterator {
            results: results.into_iter().collect(),
            next_delay: self.next_delay,
        }))
    }

    async fn get_backfill_messages(
        &self,
        args: BackfillArgs,
    ) -> Result<Vec<MessageEvent>, PlaybackError> {
        if args.cancel.is_cancelled() {
            return Err(PlaybackError::Aborted);
        }
        if let Some(delay) = self.next_delay {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = args.cancel.cancelled() => return Err(PlaybackError::Aborted),
            }
        }
        let mut latest: HashMap<&str, &MessageEvent> = HashMap::new();
        for event in &self.events {
            if event.receive_time <= args.time && args.topics.contains(&event.topic) {
                latest.insert(event.topic.as_str(), event);
            }
        }
        let mut out: Vec<MessageEvent> = latest.into_values().cloned().collect();
        out.sort_by_key(|e| e.receive_time);
        Ok(out)
    }
}

struct ScriptedIterator {
    results: std::collections::VecDeque<IteratorResult>,
    next_delay: Option<Duration>,
}

#[async_trait]
impl MessageIterator for ScriptedIterator {
    async fn next(&mut self) -> Option<Result<IteratorResult, PlaybackError>> {
        if let Some(delay) = self.next_delay {
            tokio::time::sleep(delay).await;
        }
        self.results.pop_front().map(Ok)
    }
}

/// Iterator arguments covering every topic of a script, for tests that
/// drive sources directly.
pub fn iterate_all(topics: &[&str], start: Time) -> MessageIteratorArgs {
    MessageIteratorArgs {
        topics: topics.iter().map(|t| (*t).to_owned()).collect(),
        start,
        end: None,
        consumption_type: ConsumptionType::Partial,
    }
}
