//! Initial load behavior.
//!
//! After a listener registers, the player initializes, reads the head of
//! the log up to the 99 ms start boundary, and emits an active-data state
//! within the startup budget. Messages past the boundary wait for the
//! first tick.

use std::sync::Arc;
use std::time::Duration;

use playback::{Player, PlayerOptions};
use scope_core::{PlayerPresence, SubscribePayload};
use scope_test_utils::{ScriptedSource, listener_channel, message, t, t_ms, wait_for_state};

/// The canonical script: /a at 100.0, 100.05, 150; /b at 100.1, 200.
fn source() -> Arc<ScriptedSource> {
    Arc::new(
        ScriptedSource::new(t(100), t(200))
            .with_message(message("/a", t(100)))
            .with_message(message("/a", t_ms(100, 50)))
            .with_message(message("/b", t_ms(100, 100)))
            .with_message(message("/a", t(150)))
            .with_message(message("/b", t(200))),
    )
}

#[tokio::test]
async fn initial_emission_arrives_within_the_startup_budget() {
    let player = Player::new(source(), PlayerOptions::default());
    player
        .set_subscriptions(vec![
            SubscribePayload::partial("/a"),
            SubscribePayload::partial("/b"),
        ])
        .unwrap();
    let (tx, mut rx) = listener_channel();
    player.set_listener(tx).unwrap();

    let state = wait_for_state(&mut rx, Duration::from_millis(500), |s| {
        s.active_data
            .as_ref()
            .is_some_and(|a| !a.messages.is_empty())
    })
    .await;

    assert_eq!(state.presence, PlayerPresence::Present);
    let active = state.active_data.unwrap();
    assert_eq!(active.current_time, t_ms(100, 99));
    assert_eq!(active.start_time, t(100));
    assert_eq!(active.end_time, t(200));
    assert!(!active.is_playing);
    let times: Vec<_> = active.messages.iter().map(|m| m.receive_time).collect();
    assert_eq!(times, vec![t(100), t_ms(100, 50)]);

    player.close().await;
}

#[tokio::test]
async fn every_emission_keeps_the_cursor_inside_the_log_span() {
    let player = Player::new(source(), PlayerOptions::default());
    player
        .set_subscriptions(vec![SubscribePayload::partial("/a")])
        .unwrap();
    let (tx, mut rx) = listener_channel();
    player.set_listener(tx).unwrap();

    let mut saw_active = false;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(600);
    while let Ok(Some(state)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        if let Some(active) = &state.active_data {
            saw_active = true;
            assert!(active.start_time <= active.current_time);
            assert!(active.current_time <= active.end_time);
            assert!(
                active
                    .messages
                    .windows(2)
                    .all(|w| w[0].receive_time <= w[1].receive_time),
                "messages within one emission must be time-ordered"
            );
        }
    }
    assert!(saw_active, "expected at least one active-data emission");

    player.close().await;
}

#[tokio::test]
async fn metadata_is_frozen_at_initialization() {
    let player = Player::new(source(), PlayerOptions::default());
    player
        .set_subscriptions(vec![SubscribePayload::partial("/a")])
        .unwrap();
    let (tx, mut rx) = listener_channel();
    player.set_listener(tx).unwrap();

    let state = wait_for_state(&mut rx, Duration::from_secs(5), |s| {
        s.active_data.is_some()
    })
    .await;
    let active = state.active_data.unwrap();
    let names: Vec<_> = active.topics.iter().map(|t| t.name.as_str()).collect();
    assert!(names.contains(&"/a"));
    assert!(names.contains(&"/b"));
    assert_eq!(active.topic_stats["/a"].num_messages, 3);
    assert_eq!(active.topic_stats["/b"].num_messages, 2);

    player.close().await;
}
