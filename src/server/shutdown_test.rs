//! Tests for the shutdown channel

use super::shutdown::*;
use std::time::Duration;

#[tokio::test]
async fn test_signal_starts_open_and_closes_on_shutdown() {
    let (controller, signal) = shutdown_channel();
    let observer = signal.clone();
    assert!(!signal.is_shutdown());

    controller.shutdown();

    assert!(signal.is_shutdown());
    assert!(observer.is_shutdown(), "clones observe the same channel");
}

#[tokio::test]
async fn test_wait_resolves_after_shutdown() {
    let (controller, mut signal) = shutdown_channel();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.shutdown();
    });

    let waited = tokio::time::timeout(Duration::from_secs(1), signal.wait()).await;
    assert!(waited.is_ok(), "wait() should return once shutdown is sent");
}

#[tokio::test]
async fn test_wait_resolves_when_controller_dropped() {
    let (controller, mut signal) = shutdown_channel();
    drop(controller);

    let waited = tokio::time::timeout(Duration::from_secs(1), signal.wait()).await;
    assert!(waited.is_ok(), "a dropped controller counts as shutdown");
}

#[tokio::test]
async fn test_wait_pending_without_shutdown() {
    let (_controller, mut signal) = shutdown_channel();

    let waited = tokio::time::timeout(Duration::from_millis(30), signal.wait()).await;
    assert!(waited.is_err());
}
