//! Play-to-end behavior.
//!
//! Runs under the paused tokio clock so the whole log plays in virtual
//! time: every subscribed message must arrive exactly once, in order, and
//! playback must end parked at the log end.

use std::sync::Arc;
use std::time::Duration;

use playback::{Player, PlayerOptions};
use scope_core::{SubscribePayload, Time};
use scope_test_utils::{ScriptedSource, listener_channel, message, t, t_ms, wait_for_state};

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

#[tokio::test(start_paused = true)]
async fn plays_every_message_in_order_to_the_end() {
    let player = Player::new(source(), PlayerOptions::default());
    player
        .set_subscriptions(vec![
            SubscribePayload::partial("/a"),
            SubscribePayload::partial("/b"),
        ])
        .unwrap();
    let (tx, mut rx) = listener_channel();
    player.set_listener(tx).unwrap();

    let mut delivered: Vec<Time> = Vec::new();
    let initial = wait_for_state(&mut rx, Duration::from_secs(60), |s| {
        s.active_data
            .as_ref()
            .is_some_and(|a| !a.messages.is_empty())
    })
    .await;
    delivered.extend(
        initial
            .active_data
            .unwrap()
            .messages
            .iter()
            .map(|m| m.receive_time),
    );

    player.start_playback().unwrap();

    // Drain until playback parks at the end of the log.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(600);
    loop {
        let state = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("playback did not finish")
            .expect("listener channel closed");
        let Some(active) = state.active_data else {
            continue;
        };
        delivered.extend(active.messages.iter().map(|m| m.receive_time));
        if !active.is_playing && active.current_time == t(200) {
            break;
        }
    }

    assert_eq!(
        delivered,
        vec![t(100), t_ms(100, 50), t_ms(100, 100), t(150), t(200)],
        "all messages delivered exactly once, in order"
    );

    player.close().await;
}

#[tokio::test(start_paused = true)]
async fn play_until_pauses_at_the_target() {
    let player = Player::new(source(), PlayerOptions::default());
    player
        .set_subscriptions(vec![
            SubscribePayload::partial("/a"),
            SubscribePayload::partial("/b"),
        ])
        .unwrap();
    let (tx, mut rx) = listener_channel();
    player.set_listener(tx).unwrap();
    wait_for_state(&mut rx, Duration::from_secs(60), |s| {
        s.active_data
            .as_ref()
            .is_some_and(|a| !a.messages.is_empty())
    })
    .await;

    player.play_until(t(150)).unwrap();

    let state = wait_for_state(&mut rx, Duration::from_secs(600), |s| {
        s.active_data
            .as_ref()
            .is_some_and(|a| !a.is_playing && a.current_time >= t(150))
    })
    .await;
    let active = state.active_data.unwrap();
    assert_eq!(active.current_time, t(150));

    player.close().await;
}
