//! Seek behavior.
//!
//! Seeking backfills the most recent message per subscribed topic at or
//! before the target, bumps `last_seek_time`, repositions the cursor, and
//! playback resumes from the target without re-delivering older messages.

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

fn subscribed_player() -> Player {
    let player = Player::new(source(), PlayerOptions::default());
    player
        .set_subscriptions(vec![
            SubscribePayload::partial("/a"),
            SubscribePayload::partial("/b"),
        ])
        .unwrap();
    player
}

#[tokio::test(start_paused = true)]
async fn seek_while_playing_resumes_from_the_target() {
    let player = subscribed_player();
    let (tx, mut rx) = listener_channel();
    player.set_listener(tx).unwrap();
    wait_for_state(&mut rx, Duration::from_secs(60), |s| {
        s.active_data
            .as_ref()
            .is_some_and(|a| !a.messages.is_empty())
    })
    .await;

    player.start_playback().unwrap();
    let mid = wait_for_state(&mut rx, Duration::from_secs(600), |s| {
        s.active_data
            .as_ref()
            .is_some_and(|a| a.current_time >= t(110))
    })
    .await;
    let prior_seek = mid.active_data.unwrap().last_seek_time;

    player.seek_playback(t(150)).unwrap();

    let mut backfill_times: Vec<Time> = Vec::new();
    let landed = wait_for_state(&mut rx, Duration::from_secs(60), |s| {
        if let Some(active) = &s.active_data {
            if active.last_seek_time > prior_seek {
                backfill_times.extend(active.messages.iter().map(|m| m.receive_time));
                return active.current_time == t(150);
            }
        }
        false
    })
    .await;
    assert!(landed.active_data.unwrap().last_seek_time > prior_seek);
    assert!(
        backfill_times.contains(&t(150)),
        "backfill must deliver the latest /a message at the target"
    );
    assert!(
        backfill_times.contains(&t_ms(100, 100)),
        "backfill must deliver the latest /b message at or before the target"
    );

    // Playback resumes past the target and only delivers newer messages.
    let mut resumed: Vec<Time> = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(600);
    loop {
        let state = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("playback did not finish after seek")
            .expect("listener channel closed");
        let Some(active) = state.active_data else {
            continue;
        };
        resumed.extend(active.messages.iter().map(|m| m.receive_time));
        if !active.is_playing && active.current_time == t(200) {
            break;
        }
    }
    assert_eq!(resumed, vec![t(200)], "no re-delivery of pre-seek messages");

    player.close().await;
}

#[tokio::test(start_paused = true)]
async fn seek_while_idle_backfills_and_stays_paused() {
    let player = subscribed_player();
    let (tx, mut rx) = listener_channel();
    player.set_listener(tx).unwrap();
    let initial = wait_for_state(&mut rx, Duration::from_secs(60), |s| {
        s.active_data
            .as_ref()
            .is_some_and(|a| !a.messages.is_empty())
    })
    .await;
    let prior_seek = initial.active_data.unwrap().last_seek_time;

    player.seek_playback(t(160)).unwrap();

    let state = wait_for_state(&mut rx, Duration::from_secs(60), |s| {
        s.active_data
            .as_ref()
            .is_some_and(|a| a.last_seek_time > prior_seek && a.current_time == t(160))
    })
    .await;
    let active = state.active_data.unwrap();
    assert!(!active.is_playing);

    player.close().await;
}

#[tokio::test(start_paused = true)]
async fn seek_beyond_the_log_end_clamps() {
    let player = subscribed_player();
    let (tx, mut rx) = listener_channel();
    player.set_listener(tx).unwrap();
    let initial = wait_for_state(&mut rx, Duration::from_secs(60), |s| {
        s.active_data
            .as_ref()
            .is_some_and(|a| !a.messages.is_empty())
    })
    .await;
    let prior_seek = initial.active_data.unwrap().last_seek_time;

    player.seek_playback(t(500)).unwrap();

    let state = wait_for_state(&mut rx, Duration::from_secs(60), |s| {
        s.active_data
            .as_ref()
            .is_some_and(|a| a.last_seek_time > prior_seek)
    })
    .await;
    assert_eq!(state.active_data.unwrap().current_time, t(200));

    player.close().await;
}
