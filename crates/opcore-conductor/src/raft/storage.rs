//! Durable raft state.
//!
//! ```text
//! <storage_dir>/raft/
//!   meta.json                      current term and vote
//!   log.jsonl                      one entry per line, fsynced on append
//!   snapshot-<term>-<index>.json   compacted state machine and membership
//! ```
//!
//! Appends only ever extend `log.jsonl`; truncating a conflicting suffix and compacting after a
//! snapshot rewrite it through a temporary file and a rename.

use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{ClusterMembership, ConsensusError};
use crate::fsm::{Command, FsmSnapshot, LogEntry};

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.jsonl";
const SNAPSHOT_PREFIX: &str = "snapshot-";
const SNAPSHOT_SUFFIX: &str = ".json";

/// State machine and membership as of `index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftSnapshot {
    pub index: u64,
    pub term: u64,
    pub membership: ClusterMembership,
    pub fsm: FsmSnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct HardState {
    pub(crate) term: u64,
    pub(crate) voted_for: Option<String>,
}

#[derive(Debug)]
pub(crate) struct RaftStorage {
    dir: PathBuf,
    log: File,
    hard: HardState,
    entries: VecDeque<LogEntry>,
    snapshot: Option<RaftSnapshot>,
    retain: usize,
}

impl RaftStorage {
    pub(crate) fn open(dir: &Path, retain: usize) -> Result<Self, ConsensusError> {
        std::fs::create_dir_all(dir)?;
        let hard = match std::fs::read(dir.join(META_FILE)) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => HardState::default(),
            Err(err) => return Err(err.into()),
        };
        let snapshot = match list_snapshots(dir)?.pop() {
            Some(path) => Some(serde_json::from_slice::<RaftSnapshot>(&std::fs::read(&path)?)?),
            None => None,
        };

        let (mut entries, torn) = read_log(&dir.join(LOG_FILE))?;
        if let Some(snapshot) = &snapshot {
            let disjoint = entries.back().is_some_and(|e| e.index < snapshot.index) ||
                entries.front().is_some_and(|e| e.index > snapshot.index + 1);
            if disjoint {
                warn!(
                    target: "opcore::conductor",
                    snapshot = snapshot.index,
                    "log does not reach the snapshot, discarding it"
                );
                entries.clear();
            }
        }

        let log = OpenOptions::new().create(true).append(true).open(dir.join(LOG_FILE))?;
        let mut storage = Self { dir: dir.to_path_buf(), log, hard, entries, snapshot, retain };
        if torn {
            storage.rewrite_log()?;
        }
        info!(
            target: "opcore::conductor",
            term = storage.hard.term,
            first = storage.first_index(),
            last = storage.last_index(),
            snapshot = storage.snapshot_index(),
            "opened raft storage"
        );
        Ok(storage)
    }

    /// Nothing was ever written.
    pub(crate) fn is_pristine(&self) -> bool {
        self.hard == HardState::default() && self.entries.is_empty() && self.snapshot.is_none()
    }

    pub(crate) const fn hard(&self) -> &HardState {
        &self.hard
    }

    pub(crate) fn set_hard(&mut self, term: u64, voted_for: Option<String>) -> Result<(), ConsensusError> {
        let hard = HardState { term, voted_for };
        if hard == self.hard {
            return Ok(());
        }
        write_synced(&self.dir.join(META_FILE), &serde_json::to_vec(&hard)?)?;
        self.hard = hard;
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> Option<&RaftSnapshot> {
        self.snapshot.as_ref()
    }

    pub(crate) fn snapshot_index(&self) -> u64 {
        self.snapshot.as_ref().map_or(0, |s| s.index)
    }

    pub(crate) fn last_index(&self) -> u64 {
        self.entries.back().map_or_else(|| self.snapshot_index(), |e| e.index)
    }

    pub(crate) fn last_term(&self) -> u64 {
        match (self.entries.back(), &self.snapshot) {
            (Some(e), _) => e.term,
            (None, Some(s)) => s.term,
            (None, None) => 0,
        }
    }

    pub(crate) fn first_index(&self) -> u64 {
        self.entries.front().map_or_else(|| self.last_index() + 1, |e| e.index)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entry(&self, index: u64) -> Option<&LogEntry> {
        let first = self.entries.front()?.index;
        let offset = usize::try_from(index.checked_sub(first)?).ok()?;
        self.entries.get(offset)
    }

    /// `None` once compacted away.
    pub(crate) fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if let Some(entry) = self.entry(index) {
            return Some(entry.term);
        }
        self.snapshot.as_ref().filter(|s| s.index == index).map(|s| s.term)
    }

    pub(crate) fn entries_from(&self, start: u64, max: usize) -> Vec<LogEntry> {
        let Some(first) = self.entries.front().map(|e| e.index) else { return Vec::new() };
        let skip = usize::try_from(start.saturating_sub(first)).unwrap_or(usize::MAX);
        self.entries.iter().skip(skip).take(max).cloned().collect()
    }

    /// The newest membership in the log, falling back to the snapshot's.
    pub(crate) fn latest_membership(&self) -> (u64, ClusterMembership) {
        self.entries
            .iter()
            .rev()
            .find_map(|e| match &e.command {
                Command::Membership(m) => Some((e.index, m.clone())),
                _ => None,
            })
            .or_else(|| self.snapshot.as_ref().map(|s| (s.index, s.membership.clone())))
            .unwrap_or_default()
    }

    pub(crate) fn append(&mut self, entries: &[LogEntry]) -> Result<(), ConsensusError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        self.log.write_all(&buf)?;
        self.log.sync_data()?;
        self.entries.extend(entries.iter().cloned());
        Ok(())
    }

    /// Drop `index` and everything after it.
    pub(crate) fn truncate_from(&mut self, index: u64) -> Result<(), ConsensusError> {
        let before = self.entries.len();
        self.entries.retain(|e| e.index < index);
        if self.entries.len() != before {
            debug!(target: "opcore::conductor", from = index, dropped = before - self.entries.len(), "truncated raft log");
            self.rewrite_log()?;
        }
        Ok(())
    }

    /// Persist a snapshot taken locally and compact the log behind it, keeping `trailing`
    /// entries for followers that are only slightly behind.
    pub(crate) fn save_snapshot(
        &mut self,
        snapshot: RaftSnapshot,
        trailing: u64,
    ) -> Result<PathBuf, ConsensusError> {
        let path = self.write_snapshot(&snapshot)?;
        let keep_from = snapshot.index.saturating_sub(trailing);
        let before = self.entries.len();
        self.entries.retain(|e| e.index > keep_from);
        let compacted = before - self.entries.len();
        debug!(
            target: "opcore::conductor",
            index = snapshot.index,
            term = snapshot.term,
            compacted,
            "wrote raft snapshot"
        );
        self.snapshot = Some(snapshot);
        if compacted > 0 {
            self.rewrite_log()?;
        }
        Ok(path)
    }

    /// Replace the log with a snapshot received from the leader.
    pub(crate) fn install_snapshot(&mut self, snapshot: RaftSnapshot) -> Result<(), ConsensusError> {
        self.write_snapshot(&snapshot)?;
        self.snapshot = Some(snapshot);
        self.entries.clear();
        self.rewrite_log()
    }

    fn write_snapshot(&self, snapshot: &RaftSnapshot) -> Result<PathBuf, ConsensusError> {
        let name = format!(
            "{SNAPSHOT_PREFIX}{:020}-{:020}{SNAPSHOT_SUFFIX}",
            snapshot.term, snapshot.index
        );
        let path = self.dir.join(name);
        write_synced(&path, &serde_json::to_vec(snapshot)?)?;

        let snapshots = list_snapshots(&self.dir)?;
        let stale = snapshots.len().saturating_sub(self.retain.max(1));
        for old in &snapshots[..stale] {
            if let Err(err) = std::fs::remove_file(old) {
                warn!(target: "opcore::conductor", path = %old.display(), %err, "failed to remove old snapshot");
            }
        }
        Ok(path)
    }

    fn rewrite_log(&mut self) -> Result<(), ConsensusError> {
        let mut buf = Vec::new();
        for entry in &self.entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        let path = self.dir.join(LOG_FILE);
        write_synced(&path, &buf)?;
        self.log = OpenOptions::new().append(true).open(&path)?;
        Ok(())
    }
}

/// Entries in `path`, and whether a torn final line had to be skipped.
fn read_log(path: &Path) -> Result<(VecDeque<LogEntry>, bool), ConsensusError> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((VecDeque::new(), false)),
        Err(err) => return Err(err.into()),
    };
    let lines: Vec<&str> = data.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut entries = VecDeque::with_capacity(lines.len());
    for (n, line) in lines.iter().enumerate() {
        match serde_json::from_str::<LogEntry>(line) {
            Ok(entry) => entries.push_back(entry),
            // A crash mid-append leaves at most the last line incomplete.
            Err(err) if n + 1 == lines.len() => {
                warn!(target: "opcore::conductor", line = n + 1, %err, "skipping torn raft log entry");
                return Ok((entries, true));
            }
            Err(err) => return Err(ConsensusError::Encoding(format!("log line {}: {err}", n + 1))),
        }
    }
    Ok((entries, false))
}

fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)
}

/// Snapshot files, oldest first.
fn list_snapshots(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_snapshot = path.file_name().and_then(|n| n.to_str()).is_some_and(|n| {
            n.starts_with(SNAPSHOT_PREFIX) && n.ends_with(SNAPSHOT_SUFFIX)
        });
        if is_snapshot {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
