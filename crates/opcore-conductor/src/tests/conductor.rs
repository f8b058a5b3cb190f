use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{eventually, mock_payload, start_node, two_nodes, Hub};
use crate::{Conductor, ConductorConfig, ConductorError, Consensus, Health, HealthAction, Unhealthy};

fn unhealthy() -> Health {
    Health::NotHealthy(Unhealthy::NotEnoughPeers { peers: 0, min: 1 })
}

#[tokio::test]
async fn test_leadership_moves_after_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new();
    let (raft, follower) = two_nodes(&hub, dir.path()).await;
    let conductor = Conductor::new(ConductorConfig::default(), raft.clone());
    assert!(conductor.active());

    assert_eq!(conductor.handle_health(&unhealthy()).await, HealthAction::None);
    assert_eq!(conductor.handle_health(&Health::ConnectionDown("eof".into())).await, HealthAction::None);
    assert_eq!(conductor.failures(), 2);
    assert!(!conductor.sequencer_healthy());

    // A healthy result resets the streak.
    assert_eq!(conductor.handle_health(&Health::Healthy).await, HealthAction::None);
    assert_eq!(conductor.failures(), 0);
    assert!(conductor.sequencer_healthy());

    for _ in 0..2 {
        assert_eq!(conductor.handle_health(&unhealthy()).await, HealthAction::None);
    }
    assert_eq!(conductor.handle_health(&unhealthy()).await, HealthAction::TransferredLeadership);
    assert!(!conductor.leader().await);
    assert_eq!(conductor.failures(), 0);
    eventually("b to lead", || async { follower.leader().await }).await;
    eventually("a to follow b", || async { raft.leader_with_id().await.is_some_and(|l| l.id == "b") })
        .await;
}

#[tokio::test]
async fn test_paused_conductor_does_not_act() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new();
    let (raft, _follower) = two_nodes(&hub, dir.path()).await;
    let config = ConductorConfig::builder().health_check_failure_threshold(1).paused(true).build();
    let conductor = Conductor::new(config, raft.clone());
    assert!(!conductor.active());

    assert_eq!(conductor.handle_health(&unhealthy()).await, HealthAction::Ignored);
    assert!(conductor.leader().await);

    conductor.resume();
    assert!(conductor.active());
    assert_eq!(conductor.handle_health(&unhealthy()).await, HealthAction::TransferredLeadership);
    conductor.pause();
    assert!(conductor.paused());
}

#[tokio::test]
async fn test_sole_voter_cannot_hand_over() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new();
    let raft = start_node(&hub, dir.path(), "a", true).await;
    let config = ConductorConfig::builder().health_check_failure_threshold(1).build();
    let conductor = Conductor::new(config, raft);
    assert_eq!(conductor.handle_health(&unhealthy()).await, HealthAction::TransferFailed);
    assert!(conductor.leader().await);
}

#[tokio::test]
async fn test_commit_requires_leadership() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new();
    let (raft, follower) = two_nodes(&hub, dir.path()).await;
    let conductor = Conductor::new(ConductorConfig::default(), raft.clone());

    conductor.commit_unsafe_payload(&mock_payload(1)).await.unwrap();
    assert_eq!(conductor.latest_unsafe_payload().await, Some(mock_payload(1)));

    raft.transfer_leader().await.unwrap();
    assert!(matches!(
        conductor.commit_unsafe_payload(&mock_payload(2)).await,
        Err(ConductorError::NotLeader)
    ));
    assert_eq!(conductor.consensus().latest_unsafe_payload().await, Some(mock_payload(1)));
    eventually("b to apply block 1", || async {
        follower.latest_unsafe_payload().await == Some(mock_payload(1))
    })
    .await;
}

#[tokio::test]
async fn test_run_follows_health_stream_and_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new();
    let (raft, follower) = two_nodes(&hub, dir.path()).await;
    let config = ConductorConfig::builder().health_check_failure_threshold(2).build();
    let conductor = std::sync::Arc::new(Conductor::new(config, raft.clone()));
    conductor.commit_unsafe_payload(&mock_payload(4)).await.unwrap();

    let (tx, rx) = broadcast::channel(8);
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let conductor = conductor.clone();
        let cancel = cancel.clone();
        async move { conductor.run(rx, cancel).await }
    });

    let mut leader_ch = raft.leader_ch();
    tx.send(unhealthy()).unwrap();
    tx.send(unhealthy()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), leader_ch.changed()).await.unwrap().unwrap();
    assert!(!*leader_ch.borrow());

    cancel.cancel();
    task.await.unwrap().unwrap();
    assert!(conductor.stopped());
    assert!(!conductor.active());
    assert!(matches!(
        conductor.commit_unsafe_payload(&mock_payload(5)).await,
        Err(ConductorError::Stopped)
    ));
    // Shutdown snapshotted everything applied, next to the log and the term.
    let applied = raft.last_applied().await;
    let files: Vec<String> = std::fs::read_dir(raft.dir())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    let last = format!("-{applied:020}.json");
    assert!(files.iter().any(|f| f.starts_with("snapshot-") && f.ends_with(&last)));
    assert!(files.iter().any(|f| f == "log.jsonl"));
    assert!(files.iter().any(|f| f == "meta.json"));
    assert!(follower.latest_unsafe_payload().await.is_some());
}
