use std::sync::{atomic::Ordering, Arc};

use super::mocks::MockThrottle;
use crate::{ThrottleConfig, ThrottleController};

#[tokio::test]
async fn test_throttles_above_threshold_and_releases() {
    let client = Arc::new(MockThrottle::default());
    let config = ThrottleConfig::builder().threshold(1_000).build();
    let mut throttle = ThrottleController::new(config, client.clone());

    throttle.update(10).await;
    throttle.update(2_000).await;
    assert!(throttle.is_throttling());
    throttle.update(3_000).await;
    throttle.update(500).await;
    assert!(!throttle.is_throttling());

    // Only transitions reach the sequencer.
    assert_eq!(*client.calls.lock().unwrap(), vec![(0, 0), (300, 21_000), (0, 0)]);
}

#[tokio::test]
async fn test_failed_update_is_retried() {
    let client = Arc::new(MockThrottle::default());
    let mut throttle = ThrottleController::new(ThrottleConfig::default(), client.clone());

    client.fail.store(true, Ordering::SeqCst);
    throttle.update(2_000_000).await;
    assert!(!throttle.is_throttling());

    client.fail.store(false, Ordering::SeqCst);
    throttle.update(2_000_000).await;
    assert!(throttle.is_throttling());
    assert_eq!(client.calls.lock().unwrap().len(), 1);
}
