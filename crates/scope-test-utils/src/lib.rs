// scope-test-utils: Shared test harness for the playback suite.
//
// Re-exports the scripted in-memory source plus helpers the integration
// suites use to drive a player and observe its emissions.

use std::time::Duration;

use scope_core::{PlayerState, Time};
use tokio::sync::mpsc;

pub use playback::testing::{ScriptedSource, iterate_all, message, serialized_message};

/// Seconds-resolution time literal.
pub fn t(sec: i64) -> Time {
    Time { sec, nsec: 0 }
}

/// Milliseconds-resolution time literal.
pub fn t_ms(sec: i64, ms: u32) -> Time {
    Time {
        sec,
        nsec: ms * 1_000_000,
    }
}

/// A listener channel sized for active draining in tests.
pub fn listener_channel() -> (mpsc::Sender<PlayerState>, mpsc::Receiver<PlayerState>) {
    mpsc::channel(32)
}

/// Receive states until `pred` matches, failing after `timeout`.
pub async fn wait_for_state<F>(
    rx: &mut mpsc::Receiver<PlayerState>,
    timeout: Duration,
    mut pred: F,
) -> PlayerState
where
    F: FnMut(&PlayerState) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let state = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for a matching player state")
            .expect("listener channel closed");
        if pred(&state) {
            return state;
        }
    }
}

/// Collect every message delivered while draining states until `pred`
/// matches on a state (the matching state's messages are included).
pub async fn collect_messages_until<F>(
    rx: &mut mpsc::Receiver<PlayerState>,
    timeout: Duration,
    mut pred: F,
) -> Vec<scope_core::MessageEvent>
where
    F: FnMut(&PlayerState) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut messages = Vec::new();
    loop {
        let state = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out collecting messages")
            .expect("listener channel closed");
        if let Some(active) = &state.active_data {
            messages.extend(active.messages.iter().cloned());
        }
        if pred(&state) {
            return messages;
        }
    }
}
