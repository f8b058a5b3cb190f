//! A raft server.

use std::{
    cmp::Reverse,
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
    time::Duration,
};

use alloy_primitives::Bytes;
use async_trait::async_trait;
use futures::future::join_all;
use opcore_types::ExecutionPayloadEnvelope;
use rand::Rng;
use tokio::{
    sync::{watch, Mutex},
    time::{sleep, timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    network::{
        AppendRequest, AppendResponse, NetworkError, RaftNetwork, SnapshotRequest,
        SnapshotResponse, TimeoutNowRequest, TimeoutNowResponse, VoteRequest, VoteResponse,
    },
    storage::{RaftSnapshot, RaftStorage},
    ClusterMembership, Consensus, ConsensusError, RaftConfig, ServerInfo, Suffrage, RAFT_DIR,
};
use crate::fsm::{Command, LogEntry, UnsafeHeadFsm};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

/// What the leader knows about one peer.
#[derive(Debug, Clone, Copy)]
struct Progress {
    next_index: u64,
    match_index: u64,
    last_contact: Instant,
}

#[derive(Debug)]
struct NodeState {
    role: Role,
    term: u64,
    voted_for: Option<String>,
    leader: Option<String>,
    storage: RaftStorage,
    commit_index: u64,
    last_applied: u64,
    /// Newest membership in the log, committed or not. It is the one in effect.
    membership: ClusterMembership,
    membership_index: u64,
    /// Membership as of `last_applied`; snapshots record this one.
    applied_membership: ClusterMembership,
    fsm: UnsafeHeadFsm,
    election_deadline: Instant,
    leader_contact: Option<Instant>,
    peers: HashMap<String, Progress>,
    shutdown: bool,
}

enum Outbound {
    Append(AppendRequest),
    Snapshot(SnapshotRequest),
}

enum Inbound {
    Append(AppendResponse),
    Snapshot { term: u64, index: u64 },
}

/// One member of a raft cluster replicating the unsafe head.
///
/// A background task ticks every `heartbeat_interval`: the leader replicates to its peers and
/// steps down once it cannot reach a quorum, everyone else campaigns when the leader has been
/// silent past their randomized election deadline.
pub struct RaftNode<N> {
    config: RaftConfig,
    dir: PathBuf,
    network: N,
    state: Mutex<NodeState>,
    leader_tx: watch::Sender<bool>,
    applied_tx: watch::Sender<u64>,
    dropped_rx: watch::Receiver<u64>,
    cancel: CancellationToken,
    me: Weak<Self>,
}

impl<N> fmt::Debug for RaftNode<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftNode")
            .field("server_id", &self.config.server_id)
            .field("server_addr", &self.config.server_addr)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl<N: RaftNetwork> RaftNode<N> {
    /// Replay storage, bootstrap if configured to and nothing is stored, and start ticking.
    /// A sole voter takes leadership before this returns.
    pub async fn start(config: RaftConfig, network: N) -> Result<Arc<Self>, ConsensusError> {
        let dir = config.storage_dir.join(RAFT_DIR);
        let mut storage = RaftStorage::open(&dir, config.snapshot_retain)?;
        if config.bootstrap && storage.is_pristine() {
            let membership = ClusterMembership {
                servers: vec![ServerInfo {
                    id: config.server_id.clone(),
                    addr: config.server_addr.clone(),
                    suffrage: Suffrage::Voter,
                }],
                version: 1,
            };
            storage.append(&[LogEntry { index: 1, term: 0, command: Command::Membership(membership) }])?;
            info!(target: "opcore::conductor", server_id = %config.server_id, "bootstrapped raft cluster");
        }

        let mut fsm = UnsafeHeadFsm::new();
        let mut applied = 0;
        let mut applied_membership = ClusterMembership::default();
        if let Some(snapshot) = storage.snapshot() {
            fsm.restore(&snapshot.fsm)?;
            applied = snapshot.index;
            applied_membership = snapshot.membership.clone();
            info!(
                target: "opcore::conductor",
                index = snapshot.index,
                term = snapshot.term,
                "restored raft snapshot"
            );
        }
        let (membership_index, membership) = storage.latest_membership();
        let hard = storage.hard().clone();
        let sole_voter = {
            let mut voters = membership.voters();
            matches!((voters.next(), voters.next()), (Some(v), None) if v.id == config.server_id)
        };

        let state = NodeState {
            role: Role::Follower,
            term: hard.term,
            voted_for: hard.voted_for,
            leader: None,
            storage,
            commit_index: applied,
            last_applied: applied,
            membership,
            membership_index,
            applied_membership,
            fsm,
            election_deadline: Instant::now() + election_timeout(&config),
            leader_contact: None,
            peers: HashMap::new(),
            shutdown: false,
        };
        let dropped_rx = state.fsm.subscribe_dropped();
        let node = Arc::new_cyclic(|me| Self {
            config,
            dir,
            network,
            state: Mutex::new(state),
            leader_tx: watch::Sender::new(false),
            applied_tx: watch::Sender::new(applied),
            dropped_rx,
            cancel: CancellationToken::new(),
            me: me.clone(),
        });

        tokio::spawn(tick(Arc::downgrade(&node), node.cancel.clone(), node.config.heartbeat_interval));
        if sole_voter {
            node.elect(false).await;
        }
        Ok(node)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn addr(&self) -> &str {
        &self.config.server_addr
    }

    pub async fn term(&self) -> u64 {
        self.state.lock().await.term
    }

    pub async fn commit_index(&self) -> u64 {
        self.state.lock().await.commit_index
    }

    pub async fn last_applied(&self) -> u64 {
        self.state.lock().await.last_applied
    }

    /// Entries still held in the log.
    pub async fn log_len(&self) -> usize {
        self.state.lock().await.storage.len()
    }

    /// Counts entries dropped because they did not decode.
    pub fn dropped_payloads(&self) -> watch::Receiver<u64> {
        self.dropped_rx.clone()
    }

    /// Start an election now instead of waiting for the deadline.
    pub async fn campaign(&self) -> Result<(), ConsensusError> {
        {
            let s = self.state.lock().await;
            ensure_running(&s)?;
            let id = &self.config.server_id;
            match s.membership.get(id) {
                None => return Err(ConsensusError::UnknownServer(id.clone())),
                Some(server) if server.suffrage != Suffrage::Voter => {
                    return Err(ConsensusError::NotVoter(id.clone()))
                }
                Some(_) => {}
            }
        }
        self.elect(false).await;
        Ok(())
    }

    /// Snapshot the applied state now.
    pub async fn snapshot(&self) -> Result<PathBuf, ConsensusError> {
        let mut guard = self.state.lock().await;
        self.take_snapshot(&mut guard)
    }

    pub async fn handle_vote(&self, req: VoteRequest) -> Result<VoteResponse, ConsensusError> {
        let mut guard = self.state.lock().await;
        let s = &mut *guard;
        ensure_running(s)?;
        let now = Instant::now();
        // Servers that hear from a leader ignore elections the leader did not ask for.
        let leader_alive = s.role == Role::Leader ||
            s.leader_contact.is_some_and(|t| now.duration_since(t) < self.config.election_timeout);
        if req.term < s.term || (leader_alive && !req.transfer) {
            return Ok(VoteResponse { term: s.term, granted: false });
        }
        if req.term > s.term {
            self.step_down(s, req.term, None);
        }

        let up_to_date =
            (req.last_log_term, req.last_log_index) >= (s.storage.last_term(), s.storage.last_index());
        let free = s.voted_for.as_deref().is_none_or(|v| v == req.candidate);
        if !up_to_date || !free {
            debug!(target: "opcore::conductor", candidate = %req.candidate, term = req.term, up_to_date, "denied vote");
            return Ok(VoteResponse { term: s.term, granted: false });
        }
        let term = s.term;
        self.persist_term(s, term, Some(req.candidate.clone()))?;
        s.election_deadline = now + election_timeout(&self.config);
        debug!(target: "opcore::conductor", candidate = %req.candidate, term, "granted vote");
        Ok(VoteResponse { term, granted: true })
    }

    pub async fn handle_append(&self, req: AppendRequest) -> Result<AppendResponse, ConsensusError> {
        let mut guard = self.state.lock().await;
        let s = &mut *guard;
        ensure_running(s)?;
        if req.term < s.term {
            return Ok(AppendResponse { term: s.term, success: false, last_index: s.storage.last_index() });
        }
        self.follow(s, req.term, &req.leader);

        let last = s.storage.last_index();
        if req.prev_log_index > last {
            return Ok(AppendResponse { term: s.term, success: false, last_index: last });
        }
        // Committed entries match every leader's log.
        if req.prev_log_index > s.commit_index &&
            s.storage.term_at(req.prev_log_index) != Some(req.prev_log_term)
        {
            let last_index = (req.prev_log_index - 1).max(s.commit_index);
            return Ok(AppendResponse { term: s.term, success: false, last_index });
        }

        let last_new = req.prev_log_index + req.entries.len() as u64;
        let mut fresh = Vec::new();
        for entry in req.entries {
            if fresh.is_empty() {
                if entry.index <= s.commit_index {
                    continue;
                }
                match s.storage.term_at(entry.index) {
                    Some(term) if term == entry.term => continue,
                    Some(_) => {
                        s.storage.truncate_from(entry.index)?;
                        let (index, membership) = s.storage.latest_membership();
                        s.membership = membership;
                        s.membership_index = index;
                    }
                    None => {}
                }
            }
            fresh.push(entry);
        }
        if !fresh.is_empty() {
            s.storage.append(&fresh)?;
            let membership = fresh.iter().rev().find_map(|e| match &e.command {
                Command::Membership(m) => Some((e.index, m.clone())),
                _ => None,
            });
            if let Some((index, membership)) = membership {
                self.set_membership(s, index, membership);
            }
        }

        let commit = req.leader_commit.min(last_new);
        if commit > s.commit_index {
            s.commit_index = commit;
            self.apply_committed(s);
        }
        Ok(AppendResponse { term: s.term, success: true, last_index: last_new })
    }

    pub async fn handle_install_snapshot(
        &self,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse, ConsensusError> {
        let mut guard = self.state.lock().await;
        let s = &mut *guard;
        ensure_running(s)?;
        if req.term < s.term {
            return Ok(SnapshotResponse { term: s.term });
        }
        self.follow(s, req.term, &req.leader);

        let snapshot = req.snapshot;
        if snapshot.index <= s.commit_index {
            return Ok(SnapshotResponse { term: s.term });
        }
        s.fsm.restore(&snapshot.fsm)?;
        info!(
            target: "opcore::conductor",
            leader = %req.leader,
            index = snapshot.index,
            term = snapshot.term,
            "installing snapshot from leader"
        );
        s.commit_index = snapshot.index;
        s.last_applied = snapshot.index;
        s.membership = snapshot.membership.clone();
        s.membership_index = snapshot.index;
        s.applied_membership = snapshot.membership.clone();
        s.storage.install_snapshot(snapshot)?;
        self.applied_tx.send_replace(s.last_applied);
        Ok(SnapshotResponse { term: s.term })
    }

    pub async fn handle_timeout_now(
        &self,
        req: TimeoutNowRequest,
    ) -> Result<TimeoutNowResponse, ConsensusError> {
        let term = {
            let s = self.state.lock().await;
            ensure_running(&s)?;
            if req.term < s.term || !s.membership.is_voter(&self.config.server_id) {
                return Ok(TimeoutNowResponse { term: s.term });
            }
            s.term
        };
        info!(target: "opcore::conductor", leader = %req.leader, term, "leader handed over, campaigning");
        if let Some(node) = self.me.upgrade() {
            tokio::spawn(async move { node.elect(true).await });
        }
        Ok(TimeoutNowResponse { term })
    }

    async fn on_tick(&self) {
        let (role, due) = {
            let mut guard = self.state.lock().await;
            let s = &mut *guard;
            if s.shutdown {
                return;
            }
            if s.role == Role::Leader {
                self.check_quorum(s);
            }
            (s.role, Instant::now() >= s.election_deadline)
        };
        match role {
            Role::Leader => self.replicate().await,
            Role::Follower | Role::Candidate if due => self.elect(false).await,
            Role::Follower | Role::Candidate => {}
        }
    }

    async fn elect(&self, transfer: bool) {
        let id = self.config.server_id.as_str();
        let (request, voters) = {
            let mut guard = self.state.lock().await;
            let s = &mut *guard;
            s.election_deadline = Instant::now() + election_timeout(&self.config);
            if s.shutdown || s.role == Role::Leader || !s.membership.is_voter(id) {
                return;
            }
            let term = s.term + 1;
            if let Err(err) = self.persist_term(s, term, Some(id.to_string())) {
                error!(target: "opcore::conductor", %err, "failed to persist vote for self");
                return;
            }
            s.role = Role::Candidate;
            s.leader = None;
            let request = VoteRequest {
                term,
                candidate: id.to_string(),
                last_log_index: s.storage.last_index(),
                last_log_term: s.storage.last_term(),
                transfer,
            };
            let voters: Vec<ServerInfo> = s.membership.voters().filter(|v| v.id != id).cloned().collect();
            (request, voters)
        };
        info!(target: "opcore::conductor", term = request.term, transfer, "starting election");
        let responses = join_all(voters.iter().map(|v| self.network.vote(v, request.clone()))).await;

        let mut guard = self.state.lock().await;
        let s = &mut *guard;
        if s.role != Role::Candidate || s.term != request.term {
            return;
        }
        let mut granted = 1;
        for (voter, response) in voters.iter().zip(responses) {
            match response {
                Ok(r) if r.term > s.term => {
                    self.step_down(s, r.term, None);
                    return;
                }
                Ok(r) if r.granted => granted += 1,
                Ok(_) => {}
                Err(err) => {
                    debug!(target: "opcore::conductor", peer = %voter.id, %err, "vote request failed")
                }
            }
        }
        if granted * 2 <= voters.len() + 1 {
            debug!(target: "opcore::conductor", term = s.term, granted, "election lost");
            return;
        }
        self.become_leader(s);
        drop(guard);
        self.replicate().await;
    }

    fn become_leader(&self, s: &mut NodeState) {
        let id = &self.config.server_id;
        s.role = Role::Leader;
        s.leader = Some(id.clone());
        let next_index = s.storage.last_index() + 1;
        let now = Instant::now();
        s.peers = s
            .membership
            .servers
            .iter()
            .filter(|p| &p.id != id)
            .map(|p| (p.id.clone(), Progress { next_index, match_index: 0, last_contact: now }))
            .collect();
        info!(target: "opcore::conductor", term = s.term, "won leadership");
        self.leader_tx.send_replace(true);
        if let Err(err) = self.append_local(s, Command::Noop) {
            error!(target: "opcore::conductor", %err, "failed to append no-op, stepping down");
            let term = s.term;
            self.step_down(s, term, None);
        }
    }

    /// Accept `leader` for `term`.
    fn follow(&self, s: &mut NodeState, term: u64, leader: &str) {
        if term > s.term || s.role != Role::Follower || s.leader.as_deref() != Some(leader) {
            if s.leader.as_deref() != Some(leader) {
                info!(target: "opcore::conductor", leader, term, "following leader");
            }
            self.step_down(s, term, Some(leader.to_string()));
        }
        let now = Instant::now();
        s.leader_contact = Some(now);
        s.election_deadline = now + election_timeout(&self.config);
    }

    fn step_down(&self, s: &mut NodeState, term: u64, leader: Option<String>) {
        if term > s.term {
            if let Err(err) = self.persist_term(s, term, None) {
                error!(target: "opcore::conductor", term, %err, "failed to persist term");
            }
        }
        let was_leader = s.role == Role::Leader;
        s.role = Role::Follower;
        s.leader = leader;
        s.peers.clear();
        s.election_deadline = Instant::now() + election_timeout(&self.config);
        if was_leader {
            info!(target: "opcore::conductor", term = s.term, "lost leadership");
            self.leader_tx.send_replace(false);
        }
    }

    fn persist_term(
        &self,
        s: &mut NodeState,
        term: u64,
        voted_for: Option<String>,
    ) -> Result<(), ConsensusError> {
        s.storage.set_hard(term, voted_for.clone())?;
        s.term = term;
        s.voted_for = voted_for;
        Ok(())
    }

    fn check_quorum(&self, s: &mut NodeState) {
        let id = self.config.server_id.as_str();
        let now = Instant::now();
        let voters: Vec<&str> = s.membership.voters().map(|v| v.id.as_str()).collect();
        let reachable = voters
            .iter()
            .filter(|v| {
                **v == id ||
                    s.peers.get(**v).is_some_and(|p| {
                        now.duration_since(p.last_contact) < self.config.election_timeout
                    })
            })
            .count();
        if reachable * 2 <= voters.len() {
            warn!(target: "opcore::conductor", reachable, voters = voters.len(), "lost contact with a quorum, stepping down");
            let term = s.term;
            self.step_down(s, term, None);
        }
    }

    fn append_local(&self, s: &mut NodeState, command: Command) -> Result<u64, ConsensusError> {
        let index = s.storage.last_index() + 1;
        let entry = LogEntry { index, term: s.term, command };
        s.storage.append(std::slice::from_ref(&entry))?;
        if let Command::Membership(membership) = entry.command {
            self.set_membership(s, index, membership);
        }
        self.advance_commit(s);
        Ok(index)
    }

    fn set_membership(&self, s: &mut NodeState, index: u64, membership: ClusterMembership) {
        if s.role == Role::Leader {
            let now = Instant::now();
            s.peers.retain(|id, _| membership.get(id).is_some());
            for server in &membership.servers {
                if server.id != self.config.server_id {
                    s.peers.entry(server.id.clone()).or_insert(Progress {
                        next_index: index,
                        match_index: 0,
                        last_contact: now,
                    });
                }
            }
        }
        debug!(target: "opcore::conductor", index, version = membership.version, "membership changed");
        s.membership = membership;
        s.membership_index = index;
    }

    /// Commit the newest entry of this term a quorum of voters stored, then apply.
    fn advance_commit(&self, s: &mut NodeState) {
        if s.role == Role::Leader {
            let id = self.config.server_id.as_str();
            let voters: Vec<&str> = s.membership.voters().map(|v| v.id.as_str()).collect();
            let mut index = s.storage.last_index();
            while index > s.commit_index && s.storage.term_at(index) == Some(s.term) {
                let stored = voters
                    .iter()
                    .filter(|v| **v == id || s.peers.get(**v).is_some_and(|p| p.match_index >= index))
                    .count();
                if stored * 2 > voters.len() {
                    s.commit_index = index;
                    break;
                }
                index -= 1;
            }
        }
        self.apply_committed(s);
    }

    fn apply_committed(&self, s: &mut NodeState) {
        let before = s.last_applied;
        while s.last_applied < s.commit_index {
            let index = s.last_applied + 1;
            let Some(entry) = s.storage.entry(index).cloned() else {
                warn!(target: "opcore::conductor", index, "committed entry is missing from the log");
                break;
            };
            s.fsm.apply(&entry);
            if let Command::Membership(membership) = entry.command {
                s.applied_membership = membership;
            }
            s.last_applied = index;
        }
        if s.last_applied == before {
            return;
        }
        self.applied_tx.send_replace(s.last_applied);

        let removed = s.membership_index <= s.last_applied &&
            s.membership.get(&self.config.server_id).is_none();
        if s.role == Role::Leader && removed {
            info!(target: "opcore::conductor", "removed from the cluster, stepping down");
            let term = s.term;
            self.step_down(s, term, None);
        }
        if s.last_applied - s.storage.snapshot_index() >= self.config.snapshot_interval {
            if let Err(err) = self.take_snapshot(s) {
                error!(target: "opcore::conductor", %err, "failed to snapshot");
            }
        }
    }

    fn take_snapshot(&self, s: &mut NodeState) -> Result<PathBuf, ConsensusError> {
        let snapshot = RaftSnapshot {
            index: s.last_applied,
            term: s.storage.term_at(s.last_applied).unwrap_or(s.term),
            membership: s.applied_membership.clone(),
            fsm: s.fsm.snapshot()?,
        };
        s.storage.save_snapshot(snapshot, self.config.trailing_logs)
    }

    /// One round of AppendEntries, or InstallSnapshot for peers behind the compacted log.
    async fn replicate(&self) {
        let (term, peers, requests) = {
            let guard = self.state.lock().await;
            if guard.shutdown || guard.role != Role::Leader {
                return;
            }
            let (peers, requests): (Vec<ServerInfo>, Vec<Outbound>) = guard
                .membership
                .servers
                .iter()
                .filter_map(|p| Some((p.clone(), self.outbound(&guard, guard.peers.get(&p.id)?))))
                .unzip();
            (guard.term, peers, requests)
        };
        let replies = join_all(peers.iter().zip(requests).map(|(p, r)| self.send(p, r))).await;

        let mut guard = self.state.lock().await;
        let s = &mut *guard;
        if s.role != Role::Leader || s.term != term {
            return;
        }
        for (peer, reply) in peers.iter().zip(replies) {
            self.on_reply(s, &peer.id, reply);
            if s.role != Role::Leader {
                return;
            }
        }
        self.advance_commit(s);
    }

    fn outbound(&self, s: &NodeState, progress: &Progress) -> Outbound {
        let leader = self.config.server_id.clone();
        let next = progress.next_index.clamp(1, s.storage.last_index() + 1);
        let prev = next - 1;
        // Entries before the first one held were compacted into the snapshot.
        let prev_term = s.storage.term_at(prev).filter(|_| next >= s.storage.first_index());
        match (prev_term, s.storage.snapshot()) {
            (None, Some(snapshot)) => {
                Outbound::Snapshot(SnapshotRequest { term: s.term, leader, snapshot: snapshot.clone() })
            }
            (prev_term, _) => Outbound::Append(AppendRequest {
                term: s.term,
                leader,
                prev_log_index: prev,
                prev_log_term: prev_term.unwrap_or_default(),
                entries: s.storage.entries_from(next, self.config.max_append_entries),
                leader_commit: s.commit_index,
            }),
        }
    }

    async fn send(&self, peer: &ServerInfo, request: Outbound) -> Result<Inbound, NetworkError> {
        match request {
            Outbound::Append(req) => self.network.append(peer, req).await.map(Inbound::Append),
            Outbound::Snapshot(req) => {
                let index = req.snapshot.index;
                let response = self.network.install_snapshot(peer, req).await?;
                Ok(Inbound::Snapshot { term: response.term, index })
            }
        }
    }

    fn on_reply(&self, s: &mut NodeState, peer: &str, reply: Result<Inbound, NetworkError>) {
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                debug!(target: "opcore::conductor", peer, %err, "replication failed");
                return;
            }
        };
        let term = match &reply {
            Inbound::Append(r) => r.term,
            Inbound::Snapshot { term, .. } => *term,
        };
        if term > s.term {
            info!(target: "opcore::conductor", peer, term, "peer is in a newer term");
            self.step_down(s, term, None);
            return;
        }
        let Some(progress) = s.peers.get_mut(peer) else { return };
        progress.last_contact = Instant::now();
        match reply {
            Inbound::Append(r) if r.success => {
                progress.match_index = progress.match_index.max(r.last_index);
                progress.next_index = progress.match_index + 1;
            }
            Inbound::Append(r) => {
                progress.next_index = (r.last_index + 1)
                    .min(progress.next_index.saturating_sub(1))
                    .max(progress.match_index + 1);
            }
            Inbound::Snapshot { index, .. } => {
                debug!(target: "opcore::conductor", peer, index, "peer installed snapshot");
                progress.match_index = progress.match_index.max(index);
                progress.next_index = progress.match_index + 1;
            }
        }
    }

    fn ensure_leader(&self, s: &NodeState) -> Result<(), ConsensusError> {
        ensure_running(s)?;
        if s.role != Role::Leader {
            return Err(ConsensusError::NotLeader);
        }
        Ok(())
    }

    /// Wait until `index` is applied, failing if it was written in `term` and got overwritten
    /// or this node stopped leading first.
    async fn wait_applied(&self, index: u64, term: u64) -> Result<(), ConsensusError> {
        let mut applied = self.applied_tx.subscribe();
        let mut leading = self.leader_tx.subscribe();
        let wait = async {
            loop {
                if *applied.borrow_and_update() >= index {
                    let s = self.state.lock().await;
                    return match s.storage.term_at(index) {
                        Some(stored) if stored != term => Err(ConsensusError::NotLeader),
                        _ => Ok(()),
                    };
                }
                if !*leading.borrow_and_update() {
                    return Err(ConsensusError::NotLeader);
                }
                tokio::select! {
                    changed = applied.changed() => changed.map_err(|_| ConsensusError::Shutdown)?,
                    changed = leading.changed() => changed.map_err(|_| ConsensusError::Shutdown)?,
                }
            }
        };
        timeout(self.config.commit_timeout, wait)
            .await
            .map_err(|_| ConsensusError::CommitTimeout(index))?
    }

    async fn change_membership<F>(&self, change: F) -> Result<(), ConsensusError>
    where
        F: FnOnce(&mut ClusterMembership) -> Result<(), ConsensusError> + Send,
    {
        let (index, term) = {
            let mut guard = self.state.lock().await;
            let s = &mut *guard;
            self.ensure_leader(s)?;
            if s.membership_index > s.commit_index {
                return Err(ConsensusError::ConfigChangeInProgress);
            }
            let mut membership = s.membership.clone();
            change(&mut membership)?;
            membership.version += 1;
            (self.append_local(s, Command::Membership(membership))?, s.term)
        };
        self.replicate().await;
        self.wait_applied(index, term).await
    }

    async fn add_server(&self, id: &str, addr: &str, suffrage: Suffrage) -> Result<(), ConsensusError> {
        self.change_membership(|membership| {
            match membership.servers.iter_mut().find(|s| s.id == id) {
                Some(s) if s.suffrage == Suffrage::Voter => {
                    return Err(ConsensusError::AlreadyVoter(id.to_string()))
                }
                Some(s) => {
                    s.addr = addr.to_string();
                    s.suffrage = suffrage;
                }
                None => membership.servers.push(ServerInfo {
                    id: id.to_string(),
                    addr: addr.to_string(),
                    suffrage,
                }),
            }
            Ok(())
        })
        .await?;
        info!(target: "opcore::conductor", id, addr, ?suffrage, "added server");
        Ok(())
    }

    /// Bring `id` up to date, then tell it to campaign and wait for this node to step down.
    async fn transfer_to(&self, id: &str) -> Result<(), ConsensusError> {
        let deadline = Instant::now() + self.config.commit_timeout;
        let (target, term) = loop {
            self.replicate().await;
            {
                let s = self.state.lock().await;
                self.ensure_leader(&s)?;
                if s.peers.get(id).is_some_and(|p| p.match_index >= s.storage.last_index()) {
                    let target = s
                        .membership
                        .get(id)
                        .cloned()
                        .ok_or_else(|| ConsensusError::UnknownServer(id.to_string()))?;
                    break (target, s.term);
                }
            }
            if Instant::now() >= deadline {
                return Err(ConsensusError::TransferTimeout(id.to_string()));
            }
            sleep(self.config.heartbeat_interval).await;
        };

        info!(target: "opcore::conductor", to = id, term, "transferring leadership");
        let mut leading = self.leader_tx.subscribe();
        let request = TimeoutNowRequest { term, leader: self.config.server_id.clone() };
        self.network.timeout_now(&target, request).await?;
        let stepped_down = async {
            while *leading.borrow_and_update() {
                if leading.changed().await.is_err() {
                    break;
                }
            }
        };
        timeout(self.config.commit_timeout, stepped_down)
            .await
            .map_err(|_| ConsensusError::TransferTimeout(id.to_string()))
    }
}

#[async_trait]
impl<N: RaftNetwork> Consensus for RaftNode<N> {
    fn server_id(&self) -> &str {
        &self.config.server_id
    }

    async fn leader(&self) -> bool {
        let s = self.state.lock().await;
        !s.shutdown && s.role == Role::Leader
    }

    async fn leader_with_id(&self) -> Option<ServerInfo> {
        let s = self.state.lock().await;
        let leader = s.leader.as_deref()?;
        s.membership.get(leader).cloned()
    }

    fn leader_ch(&self) -> watch::Receiver<bool> {
        self.leader_tx.subscribe()
    }

    async fn commit_unsafe_payload(
        &self,
        payload: &ExecutionPayloadEnvelope,
    ) -> Result<(), ConsensusError> {
        let data = Bytes::from(payload.encode()?);
        let (index, term) = {
            let mut guard = self.state.lock().await;
            let s = &mut *guard;
            self.ensure_leader(s)?;
            (self.append_local(s, Command::Payload(data))?, s.term)
        };
        self.replicate().await;
        self.wait_applied(index, term).await?;
        debug!(
            target: "opcore::conductor",
            index,
            number = payload.block_number(),
            hash = %payload.block_hash(),
            "committed unsafe payload"
        );
        Ok(())
    }

    async fn latest_unsafe_payload(&self) -> Option<ExecutionPayloadEnvelope> {
        self.state.lock().await.fsm.latest().cloned()
    }

    /// Hands over to the voter furthest along in replication.
    async fn transfer_leader(&self) -> Result<(), ConsensusError> {
        let target = {
            let s = self.state.lock().await;
            self.ensure_leader(&s)?;
            let id = &self.config.server_id;
            s.membership
                .voters()
                .filter(|v| &v.id != id)
                .min_by_key(|v| Reverse(s.peers.get(&v.id).map_or(0, |p| p.match_index)))
                .map(|v| v.id.clone())
                .ok_or(ConsensusError::NoTransferTarget)?
        };
        self.transfer_to(&target).await
    }

    async fn transfer_leader_to(&self, id: &str) -> Result<(), ConsensusError> {
        {
            let s = self.state.lock().await;
            self.ensure_leader(&s)?;
            match s.membership.get(id) {
                None => return Err(ConsensusError::UnknownServer(id.to_string())),
                Some(server) if server.suffrage != Suffrage::Voter => {
                    return Err(ConsensusError::NotVoter(id.to_string()))
                }
                Some(_) if id == self.config.server_id => return Ok(()),
                Some(_) => {}
            }
        }
        self.transfer_to(id).await
    }

    async fn add_voter(&self, id: &str, addr: &str) -> Result<(), ConsensusError> {
        self.add_server(id, addr, Suffrage::Voter).await
    }

    async fn add_nonvoter(&self, id: &str, addr: &str) -> Result<(), ConsensusError> {
        self.add_server(id, addr, Suffrage::Nonvoter).await
    }

    async fn remove_server(&self, id: &str) -> Result<(), ConsensusError> {
        self.change_membership(|membership| {
            let before = membership.servers.len();
            membership.servers.retain(|s| s.id != id);
            if membership.servers.len() == before {
                return Err(ConsensusError::UnknownServer(id.to_string()));
            }
            Ok(())
        })
        .await?;
        info!(target: "opcore::conductor", id, "removed server");
        Ok(())
    }

    async fn cluster_membership(&self) -> ClusterMembership {
        self.state.lock().await.membership.clone()
    }

    /// Stop ticking, snapshot whatever was applied since the last snapshot and step down.
    async fn shutdown(&self) -> Result<(), ConsensusError> {
        let mut guard = self.state.lock().await;
        let s = &mut *guard;
        if s.shutdown {
            return Ok(());
        }
        self.cancel.cancel();
        if s.last_applied > s.storage.snapshot_index() {
            self.take_snapshot(s)?;
        }
        let term = s.term;
        self.step_down(s, term, None);
        s.shutdown = true;
        info!(target: "opcore::conductor", commit_index = s.commit_index, "raft shut down");
        Ok(())
    }
}

fn ensure_running(s: &NodeState) -> Result<(), ConsensusError> {
    if s.shutdown {
        return Err(ConsensusError::Shutdown);
    }
    Ok(())
}

/// Somewhere in `[election_timeout, 2 * election_timeout)`.
fn election_timeout(config: &RaftConfig) -> Duration {
    config.election_timeout + config.election_timeout.mul_f64(rand::thread_rng().gen::<f64>())
}

async fn tick<N: RaftNetwork>(node: Weak<RaftNode<N>>, cancel: CancellationToken, interval: Duration) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }
        let Some(node) = node.upgrade() else { break };
        node.on_tick().await;
    }
}
