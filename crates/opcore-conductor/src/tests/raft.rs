use alloy_primitives::Bytes;

use super::{eventually, mock_payload, raft_config, start_node, start_with, two_nodes, Hub, TestNode};
use crate::{
    AppendRequest, ClusterMembership, Command, Consensus, ConsensusError, LogEntry, ServerInfo,
    Suffrage, VoteRequest,
};

fn snapshots(node: &TestNode) -> usize {
    std::fs::read_dir(node.dir())
        .unwrap()
        .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with("snapshot-"))
        .count()
}

fn payload_entry(index: u64, term: u64, number: u64) -> LogEntry {
    LogEntry::payload(index, term, mock_payload(number).encode().unwrap())
}

fn vote(term: u64, candidate: &str, last_log_index: u64, last_log_term: u64, transfer: bool) -> VoteRequest {
    VoteRequest { term, candidate: candidate.to_string(), last_log_index, last_log_term, transfer }
}

#[tokio::test]
async fn test_bootstrapped_node_leads_and_commits() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new();
    let raft = start_node(&hub, dir.path(), "a", true).await;
    assert!(raft.leader().await);
    assert!(*raft.leader_ch().borrow());
    assert_eq!(raft.term().await, 1);
    assert_eq!(raft.leader_with_id().await.unwrap().addr, "a");
    assert!(raft.latest_unsafe_payload().await.is_none());

    for n in 1..=3 {
        raft.commit_unsafe_payload(&mock_payload(n)).await.unwrap();
    }
    // Bootstrap membership, the leader's no-op, then three payloads.
    assert_eq!(raft.commit_index().await, 5);
    assert_eq!(raft.latest_unsafe_payload().await, Some(mock_payload(3)));
}

#[tokio::test]
async fn test_node_outside_any_cluster_stays_follower() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new();
    let raft = start_node(&hub, dir.path(), "a", false).await;
    assert!(!raft.leader().await);
    assert!(raft.leader_with_id().await.is_none());
    assert!(matches!(
        raft.commit_unsafe_payload(&mock_payload(1)).await,
        Err(ConsensusError::NotLeader)
    ));
    assert!(matches!(raft.campaign().await, Err(ConsensusError::UnknownServer(_))));
}

#[tokio::test]
async fn test_log_replays_after_restart_without_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new();
    let mut config = raft_config(dir.path(), "a", true);
    config.snapshot_interval = 1000;

    let raft = start_with(&hub, config.clone()).await;
    raft.commit_unsafe_payload(&mock_payload(1)).await.unwrap();
    raft.commit_unsafe_payload(&mock_payload(2)).await.unwrap();
    assert_eq!(snapshots(&raft), 0);
    drop(raft);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let reopened = start_with(&hub, config).await;
    assert_eq!(snapshots(&reopened), 0);
    assert!(reopened.leader().await);
    assert_eq!(reopened.term().await, 2);
    assert_eq!(reopened.latest_unsafe_payload().await, Some(mock_payload(2)));
}

#[tokio::test]
async fn test_snapshots_compact_log_and_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new();
    let raft = start_node(&hub, dir.path(), "a", true).await;
    for n in 1..=9 {
        raft.commit_unsafe_payload(&mock_payload(n)).await.unwrap();
    }
    // Snapshots at 4 and 8 keep two trailing entries each; 9..=11 came after.
    assert_eq!(raft.commit_index().await, 11);
    assert_eq!(raft.log_len().await, 5);
    assert_eq!(snapshots(&raft), 2);

    raft.shutdown().await.unwrap();
    assert!(!raft.leader().await);
    assert!(matches!(raft.commit_unsafe_payload(&mock_payload(10)).await, Err(ConsensusError::Shutdown)));
    // The final snapshot at 11 replaces the one at 4.
    assert_eq!(snapshots(&raft), 2);
    drop(raft);

    let reopened = start_node(&hub, dir.path(), "a", true).await;
    assert_eq!(reopened.latest_unsafe_payload().await, Some(mock_payload(9)));
    assert_eq!(reopened.term().await, 2);
    assert_eq!(reopened.commit_index().await, 12);
    assert_eq!(reopened.cluster_membership().await.voters().count(), 1);
}

#[tokio::test]
async fn test_commits_replicate_to_follower() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new();
    let (a, b) = two_nodes(&hub, dir.path()).await;
    for n in 1..=3 {
        a.commit_unsafe_payload(&mock_payload(n)).await.unwrap();
    }
    eventually("b to apply block 3", || async { b.latest_unsafe_payload().await == Some(mock_payload(3)) })
        .await;

    assert!(!b.leader().await);
    assert_eq!(b.leader_with_id().await.unwrap().id, "a");
    assert_eq!(b.cluster_membership().await.voters().count(), 2);
    assert!(matches!(b.commit_unsafe_payload(&mock_payload(4)).await, Err(ConsensusError::NotLeader)));
}

#[tokio::test]
async fn test_transfer_hands_leadership_and_state_to_target() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new();
    let (a, b) = two_nodes(&hub, dir.path()).await;
    a.commit_unsafe_payload(&mock_payload(1)).await.unwrap();

    let mut leader_ch = a.leader_ch();
    a.transfer_leader().await.unwrap();
    assert!(!a.leader().await);
    assert!(!*leader_ch.borrow_and_update());

    eventually("b to lead", || async { b.leader().await }).await;
    eventually("b to apply block 1", || async { b.latest_unsafe_payload().await == Some(mock_payload(1)) })
        .await;
    assert!(b.term().await > 1);
    assert!(matches!(a.commit_unsafe_payload(&mock_payload(2)).await, Err(ConsensusError::NotLeader)));

    // The new leader replicates back.
    b.commit_unsafe_payload(&mock_payload(2)).await.unwrap();
    eventually("a to follow b", || async {
        a.leader_with_id().await.is_some_and(|l| l.id == "b") &&
            a.latest_unsafe_payload().await == Some(mock_payload(2))
    })
    .await;
}

#[tokio::test]
async fn test_transfer_targets_and_membership_changes() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new();
    let a = start_node(&hub, &dir.path().join("a"), "a", true).await;
    assert!(matches!(a.transfer_leader().await, Err(ConsensusError::NoTransferTarget)));

    let c = start_node(&hub, &dir.path().join("c"), "c", false).await;
    a.add_nonvoter("c", "c").await.unwrap();
    assert!(matches!(a.transfer_leader().await, Err(ConsensusError::NoTransferTarget)));
    assert!(matches!(a.transfer_leader_to("c").await, Err(ConsensusError::NotVoter(_))));
    assert!(matches!(a.transfer_leader_to("z").await, Err(ConsensusError::UnknownServer(_))));
    a.transfer_leader_to("a").await.unwrap();
    assert!(a.leader().await);

    let _b = start_node(&hub, &dir.path().join("b"), "b", false).await;
    a.add_voter("b", "b").await.unwrap();
    assert!(matches!(a.add_voter("b", "b").await, Err(ConsensusError::AlreadyVoter(_))));
    let membership = a.cluster_membership().await;
    assert_eq!(membership.version, 3);
    assert_eq!(membership.get("c").unwrap().suffrage, Suffrage::Nonvoter);
    assert_eq!(membership.voters().count(), 2);

    // Nonvoters receive the log without counting towards a quorum.
    a.commit_unsafe_payload(&mock_payload(1)).await.unwrap();
    eventually("c to apply block 1", || async { c.latest_unsafe_payload().await == Some(mock_payload(1)) })
        .await;
}

#[tokio::test]
async fn test_cut_off_leader_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new();
    let (a, b) = two_nodes(&hub, dir.path()).await;
    let c = start_node(&hub, &dir.path().join("c"), "c", false).await;
    a.add_voter("c", "c").await.unwrap();
    a.commit_unsafe_payload(&mock_payload(1)).await.unwrap();

    hub.disconnect("a");
    eventually("a to step down", || async { !a.leader().await }).await;
    eventually("b or c to lead", || async { b.leader().await || c.leader().await }).await;
    let leader = if b.leader().await { &b } else { &c };
    leader.commit_unsafe_payload(&mock_payload(2)).await.unwrap();

    hub.reconnect("a");
    eventually("a to catch up", || async { a.latest_unsafe_payload().await == Some(mock_payload(2)) })
        .await;
}

#[tokio::test]
async fn test_removed_leader_steps_down() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new();
    let (a, b) = two_nodes(&hub, dir.path()).await;
    assert!(matches!(a.remove_server("q").await, Err(ConsensusError::UnknownServer(_))));

    a.remove_server("a").await.unwrap();
    assert!(!a.leader().await);
    eventually("b to lead alone", || async { b.leader().await }).await;
    assert_eq!(b.cluster_membership().await.servers.len(), 1);
    b.commit_unsafe_payload(&mock_payload(7)).await.unwrap();
}

#[tokio::test]
async fn test_lagging_voter_catches_up_from_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new();
    let a = start_node(&hub, &dir.path().join("a"), "a", true).await;
    for n in 1..=9 {
        a.commit_unsafe_payload(&mock_payload(n)).await.unwrap();
    }

    let b = start_node(&hub, &dir.path().join("b"), "b", false).await;
    a.add_voter("b", "b").await.unwrap();
    eventually("b to apply block 9", || async { b.latest_unsafe_payload().await == Some(mock_payload(9)) })
        .await;
    assert!(snapshots(&b) >= 1);
    assert_eq!(b.cluster_membership().await.voters().count(), 2);
}

#[tokio::test]
async fn test_follower_log_repair_and_dropped_payloads() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new();
    let mut config = raft_config(dir.path(), "b", false);
    config.snapshot_interval = 1000;
    let raft = start_with(&hub, config).await;
    let mut dropped = raft.dropped_payloads();

    let membership = ClusterMembership {
        servers: vec![ServerInfo { id: "x".into(), addr: "x".into(), suffrage: Suffrage::Voter }],
        version: 1,
    };
    let append = |term: u64, prev_log_index: u64, prev_log_term: u64, entries, leader_commit| AppendRequest {
        term,
        leader: if term == 1 { "x".to_string() } else { "y".to_string() },
        prev_log_index,
        prev_log_term,
        entries,
        leader_commit,
    };
    let entries = vec![
        LogEntry { index: 1, term: 1, command: Command::Membership(membership) },
        payload_entry(2, 1, 1),
        LogEntry::payload(3, 1, Bytes::from_static(&[0xff])),
        payload_entry(4, 1, 3),
    ];
    let response = raft.handle_append(append(1, 0, 0, entries, 4)).await.unwrap();
    assert!(response.success);
    assert_eq!(response.last_index, 4);
    assert_eq!(raft.latest_unsafe_payload().await, Some(mock_payload(3)));
    assert_eq!(*dropped.borrow_and_update(), 1);
    assert_eq!(raft.leader_with_id().await.unwrap().id, "x");
    assert!(!raft.leader().await);

    // Stale terms and gaps are refused.
    let stale = raft.handle_append(append(0, 4, 1, vec![], 4)).await.unwrap();
    assert!(!stale.success);
    assert_eq!(stale.term, 1);
    let gap = raft.handle_append(append(1, 9, 1, vec![], 4)).await.unwrap();
    assert!(!gap.success);
    assert_eq!(gap.last_index, 4);

    // Uncommitted entries of a deposed leader are overwritten by the next one.
    let tail = vec![payload_entry(5, 1, 5), payload_entry(6, 1, 6)];
    assert!(raft.handle_append(append(1, 4, 1, tail, 4)).await.unwrap().success);
    assert_eq!(raft.log_len().await, 6);
    let conflict = raft.handle_append(append(2, 4, 1, vec![payload_entry(5, 2, 7)], 5)).await.unwrap();
    assert!(conflict.success);
    assert_eq!(raft.log_len().await, 5);
    assert_eq!(raft.commit_index().await, 5);
    assert_eq!(raft.latest_unsafe_payload().await, Some(mock_payload(7)));
    assert_eq!(raft.term().await, 2);
}

#[tokio::test]
async fn test_votes_are_granted_once_and_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new();
    let raft = start_node(&hub, dir.path(), "b", false).await;

    assert!(raft.handle_vote(vote(1, "x", 0, 0, false)).await.unwrap().granted);
    assert!(!raft.handle_vote(vote(1, "y", 0, 0, false)).await.unwrap().granted);
    assert!(raft.handle_vote(vote(1, "x", 0, 0, false)).await.unwrap().granted);
    assert!(raft.handle_vote(vote(2, "y", 0, 0, false)).await.unwrap().granted);
    assert_eq!(raft.term().await, 2);
    drop(raft);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // The vote for y in term 2 is on disk.
    let raft = start_node(&hub, dir.path(), "b", false).await;
    assert_eq!(raft.term().await, 2);
    assert!(!raft.handle_vote(vote(2, "z", 5, 2, false)).await.unwrap().granted);

    // A follower that hears from its leader only votes when the leader hands over, and then
    // only for a log at least as complete as its own.
    let entries = vec![payload_entry(1, 2, 1)];
    let request = AppendRequest {
        term: 2,
        leader: "y".into(),
        prev_log_index: 0,
        prev_log_term: 0,
        entries,
        leader_commit: 1,
    };
    assert!(raft.handle_append(request).await.unwrap().success);
    assert!(!raft.handle_vote(vote(3, "z", 1, 2, false)).await.unwrap().granted);
    assert!(!raft.handle_vote(vote(3, "z", 0, 0, true)).await.unwrap().granted);
    assert!(raft.handle_vote(vote(4, "z", 1, 2, true)).await.unwrap().granted);
    assert_eq!(raft.term().await, 4);
}
