//! Control-surface preconditions and pre-listener behavior.

use std::sync::Arc;
use std::time::Duration;

use playback::{PlaybackError, Player, PlayerOptions};
use scope_core::{SubscribePayload, Time};
use scope_test_utils::{ScriptedSource, listener_channel, message, t, t_ms, wait_for_state};

fn source() -> Arc<ScriptedSource> {
    Arc::new(
        ScriptedSource::new(t(100), t(200))
            .with_message(message("/a", t(100)))
            .with_message(message("/a", t(150)))
            .with_message(message("/a", t(200))),
    )
}

#[tokio::test(start_paused = true)]
async fn zero_speed_is_rejected_and_the_prior_speed_survives() {
    let player = Player::new(source(), PlayerOptions::default());
    player
        .set_subscriptions(vec![SubscribePayload::partial("/a")])
        .unwrap();
    let (tx, mut rx) = listener_channel();
    player.set_listener(tx).unwrap();
    wait_for_state(&mut rx, Duration::from_secs(60), |s| s.active_data.is_some()).await;

    player.set_playback_speed(2.0).unwrap();
    wait_for_state(&mut rx, Duration::from_secs(60), |s| {
        s.active_data.as_ref().is_some_and(|a| a.speed == 2.0)
    })
    .await;

    let err = player.set_playback_speed(0.0).unwrap_err();
    assert!(matches!(err, PlaybackError::Precondition(_)));
    let err = player.set_playback_speed(-0.5).unwrap_err();
    assert!(matches!(err, PlaybackError::Precondition(_)));

    // Later emissions still carry the prior speed.
    player.start_playback().unwrap();
    let state = wait_for_state(&mut rx, Duration::from_secs(60), |s| {
        s.active_data.as_ref().is_some_and(|a| a.is_playing)
    })
    .await;
    assert_eq!(state.active_data.unwrap().speed, 2.0);

    player.close().await;
}

#[tokio::test(start_paused = true)]
async fn play_until_in_the_past_is_a_precondition_violation() {
    let player = Player::new(source(), PlayerOptions::default());
    player
        .set_subscriptions(vec![SubscribePayload::partial("/a")])
        .unwrap();
    let (tx, mut rx) = listener_channel();
    player.set_listener(tx).unwrap();
    wait_for_state(&mut rx, Duration::from_secs(60), |s| s.active_data.is_some()).await;

    // The cursor sits at start + 99 ms after the initial read.
    let err = player.play_until(t(100)).unwrap_err();
    assert!(matches!(err, PlaybackError::Precondition(_)));

    player.close().await;
}

#[tokio::test(start_paused = true)]
async fn seek_issued_before_the_listener_takes_effect_at_startup() {
    let player = Player::new(source(), PlayerOptions::default());
    player
        .set_subscriptions(vec![SubscribePayload::partial("/a")])
        .unwrap();
    // No listener yet: the machine is pre-init and just records the target.
    player.seek_playback(t(150)).unwrap();

    let (tx, mut rx) = listener_channel();
    player.set_listener(tx).unwrap();
    let state = wait_for_state(&mut rx, Duration::from_secs(60), |s| {
        s.active_data
            .as_ref()
            .is_some_and(|a| a.last_seek_time > 0)
    })
    .await;
    let active = state.active_data.unwrap();
    assert_eq!(active.current_time, t(150));
    // The backfill delivered the latest /a at or before the target.
    let times: Vec<Time> = active.messages.iter().map(|m| m.receive_time).collect();
    assert_eq!(times, vec![t(150)]);

    player.close().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_seeks_do_not_rerun_the_backfill() {
    let player = Player::new(source(), PlayerOptions::default());
    player
        .set_subscriptions(vec![SubscribePayload::partial("/a")])
        .unwrap();
    let (tx, mut rx) = listener_channel();
    player.set_listener(tx).unwrap();
    wait_for_state(&mut rx, Duration::from_secs(60), |s| s.active_data.is_some()).await;

    player.seek_playback(t(150)).unwrap();
    let state = wait_for_state(&mut rx, Duration::from_secs(60), |s| {
        s.active_data
            .as_ref()
            .is_some_and(|a| a.current_time == t(150))
    })
    .await;
    let seek_count = state.active_data.unwrap().last_seek_time;

    // Same target again: ignored, the seek counter must not advance.
    player.seek_playback(t(150)).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(state) = rx.try_recv() {
        if let Some(active) = state.active_data {
            assert_eq!(active.last_seek_time, seek_count);
        }
    }

    player.close().await;
}
