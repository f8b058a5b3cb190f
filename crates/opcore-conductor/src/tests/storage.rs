use std::io::Write;

use crate::{
    fsm::{Command, FsmSnapshot, LogEntry},
    raft::{storage::RaftStorage, ClusterMembership, RaftSnapshot, ServerInfo, Suffrage},
};

fn entries(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<LogEntry> {
    range.map(|i| LogEntry::payload(i, term, vec![i as u8])).collect()
}

fn membership(id: &str) -> ClusterMembership {
    ClusterMembership {
        servers: vec![ServerInfo { id: id.into(), addr: id.into(), suffrage: Suffrage::Voter }],
        version: 1,
    }
}

fn snapshot(index: u64, term: u64) -> RaftSnapshot {
    RaftSnapshot { index, term, membership: membership("s"), fsm: FsmSnapshot::default() }
}

#[test]
fn test_log_and_vote_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut storage = RaftStorage::open(dir.path(), 2).unwrap();
    assert!(storage.is_pristine());
    assert_eq!(storage.term_at(0), Some(0));
    assert_eq!(storage.first_index(), 1);

    storage.set_hard(3, Some("b".into())).unwrap();
    storage.append(&entries(1..=2, 2)).unwrap();
    storage.append(&entries(3..=3, 3)).unwrap();
    drop(storage);

    let storage = RaftStorage::open(dir.path(), 2).unwrap();
    assert!(!storage.is_pristine());
    assert_eq!(storage.hard().term, 3);
    assert_eq!(storage.hard().voted_for.as_deref(), Some("b"));
    assert_eq!((storage.last_index(), storage.last_term()), (3, 3));
    assert_eq!(storage.entry(2), Some(&entries(2..=2, 2)[0]));
    assert_eq!(storage.entries_from(2, 10).len(), 2);
    assert_eq!(storage.entries_from(1, 1).len(), 1);
}

#[test]
fn test_truncation_and_torn_tail() {
    let dir = tempfile::tempdir().unwrap();
    let mut storage = RaftStorage::open(dir.path(), 2).unwrap();
    let mut log = entries(1..=3, 1);
    log[1] = LogEntry { index: 2, term: 1, command: Command::Membership(membership("m")) };
    storage.append(&log).unwrap();
    assert_eq!(storage.latest_membership(), (2, membership("m")));

    storage.truncate_from(2).unwrap();
    assert_eq!(storage.len(), 1);
    assert_eq!(storage.latest_membership(), (0, ClusterMembership::default()));
    drop(storage);

    // A crash in the middle of an append leaves half a line behind.
    let mut file = std::fs::OpenOptions::new().append(true).open(dir.path().join("log.jsonl")).unwrap();
    file.write_all(br#"{"index":2,"term":1,"comm"#).unwrap();
    drop(file);

    let mut storage = RaftStorage::open(dir.path(), 2).unwrap();
    assert_eq!(storage.len(), 1);
    storage.append(&entries(2..=2, 1)).unwrap();
    drop(storage);
    assert_eq!(RaftStorage::open(dir.path(), 2).unwrap().last_index(), 2);
}

#[test]
fn test_corrupt_entry_before_the_tail_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut storage = RaftStorage::open(dir.path(), 2).unwrap();
    storage.append(&entries(1..=1, 1)).unwrap();
    drop(storage);

    let path = dir.path().join("log.jsonl");
    let good = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, format!("not json\n{good}")).unwrap();
    assert!(RaftStorage::open(dir.path(), 2).is_err());
}

#[test]
fn test_snapshots_compact_and_rotate() {
    let dir = tempfile::tempdir().unwrap();
    let mut storage = RaftStorage::open(dir.path(), 2).unwrap();
    storage.append(&entries(1..=6, 1)).unwrap();

    storage.save_snapshot(snapshot(5, 1), 2).unwrap();
    assert_eq!(storage.first_index(), 4);
    assert_eq!(storage.term_at(3), None);
    assert_eq!(storage.term_at(5), Some(1));
    assert_eq!(storage.latest_membership(), (5, membership("s")));

    storage.append(&entries(7..=8, 2)).unwrap();
    storage.save_snapshot(snapshot(7, 2), 2).unwrap();
    storage.save_snapshot(snapshot(8, 2), 2).unwrap();
    let files = std::fs::read_dir(dir.path())
        .unwrap()
        .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with("snapshot-"))
        .count();
    assert_eq!(files, 2);
    drop(storage);

    let mut storage = RaftStorage::open(dir.path(), 2).unwrap();
    assert_eq!(storage.snapshot_index(), 8);
    assert_eq!(storage.first_index(), 7);
    assert_eq!(storage.last_index(), 8);

    // A snapshot from the leader replaces the whole log.
    storage.install_snapshot(snapshot(20, 4)).unwrap();
    assert_eq!(storage.len(), 0);
    assert_eq!((storage.last_index(), storage.last_term()), (20, 4));
    assert_eq!(storage.first_index(), 21);
    assert_eq!(storage.term_at(20), Some(4));
    drop(storage);
    assert_eq!(RaftStorage::open(dir.path(), 2).unwrap().last_index(), 20);
}
