//! Full-preload subscriptions and progress reporting.
//!
//! A `full` subscription drives the block loader: progress emissions carry
//! the block cache, normalized fully-loaded ranges, and memory residency.

use std::sync::Arc;
use std::time::Duration;

use playback::{Player, PlayerOptions};
use scope_core::SubscribePayload;
use scope_test_utils::{ScriptedSource, listener_channel, message, t, wait_for_state};

fn source() -> Arc<ScriptedSource> {
    Arc::new(
        ScriptedSource::new(t(0), t(40)).with_messages(
            [5, 15, 25, 35].into_iter().map(|s| message("/cam", t(s))),
        ),
    )
}

fn options() -> PlayerOptions {
    PlayerOptions {
        max_blocks: 4,
        ..PlayerOptions::default()
    }
}

#[tokio::test]
async fn full_preload_populates_the_block_cache() {
    let player = Player::new(source(), options());
    player
        .set_subscriptions(vec![SubscribePayload::full("/cam")])
        .unwrap();
    let (tx, mut rx) = listener_channel();
    player.set_listener(tx).unwrap();

    let state = wait_for_state(&mut rx, Duration::from_secs(10), |s| {
        s.progress
            .fully_loaded_fraction_ranges
            .as_ref()
            .is_some_and(|ranges| {
                ranges.len() == 1 && ranges[0].start == 0.0 && ranges[0].end == 1.0
            })
    })
    .await;

    let cache = state.progress.message_cache.expect("block cache present");
    assert_eq!(cache.blocks.len(), 4);
    for block in &cache.blocks {
        let block = block.as_ref().expect("every block loaded");
        assert_eq!(block.messages_by_topic["/cam"].len(), 1);
    }
    assert!(state.progress.memory_info.contains_key("block-cache"));

    player.close().await;
}

#[tokio::test]
async fn partial_subscriptions_do_not_preload_blocks() {
    let player = Player::new(source(), options());
    player
        .set_subscriptions(vec![SubscribePayload::partial("/cam")])
        .unwrap();
    let (tx, mut rx) = listener_channel();
    player.set_listener(tx).unwrap();

    wait_for_state(&mut rx, Duration::from_secs(10), |s| {
        s.active_data.is_some()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut loaded = false;
    while let Ok(state) = rx.try_recv() {
        if let Some(cache) = state.progress.message_cache {
            loaded = cache.blocks.iter().any(|b| {
                b.as_ref()
                    .is_some_and(|block| !block.messages_by_topic.is_empty())
            });
        }
    }
    assert!(!loaded, "partial subscriptions must not fill the block cache");

    player.close().await;
}

#[tokio::test]
async fn upgrading_a_subscription_to_full_triggers_preload() {
    let player = Player::new(source(), options());
    player
        .set_subscriptions(vec![SubscribePayload::partial("/cam")])
        .unwrap();
    let (tx, mut rx) = listener_channel();
    player.set_listener(tx).unwrap();
    wait_for_state(&mut rx, Duration::from_secs(10), |s| {
        s.active_data.is_some()
    })
    .await;

    player
        .set_subscriptions(vec![SubscribePayload::full("/cam")])
        .unwrap();

    let state = wait_for_state(&mut rx, Duration::from_secs(10), |s| {
        s.progress
            .fully_loaded_fraction_ranges
            .as_ref()
            .is_some_and(|ranges| {
                ranges.len() == 1 && ranges[0].start == 0.0 && ranges[0].end == 1.0
            })
    })
    .await;
    assert!(state.progress.message_cache.is_some());

    player.close().await;
}
