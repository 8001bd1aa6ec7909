//! Raft Consensus for the Master Cluster
//!
//! A compact Raft implementation behind the [`ConsensusLog`] trait:
//! randomized leader election, log replication over gRPC, majority
//! commit, snapshotting, and durable term/vote/log state under the
//! master's meta directory.
//!
//! ## Files
//!
//! - `raft_meta.json`: current term and vote (rewritten atomically)
//! - `raft_log.jsonl`: one JSON log entry per line, append-only; rewritten
//!   only on conflict truncation or snapshot compaction
//! - `raft_snapshot.json`: applied state at a log prefix, taken every
//!   [`SNAPSHOT_THRESHOLD`] applied entries
//!
//! ## Membership
//!
//! The voter set is exactly the configured peer list. A node whose own
//! address is missing from that list runs as a **learner**: it accepts
//! replication and serves reads but never starts elections or votes, so a
//! misconfigured node can shadow the cluster without splitting it.
//!
//! ## Single node
//!
//! A one-voter cluster elects itself on the first election tick and
//! commits proposals immediately, which is what the embedded
//! `server` command runs.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use needlehouse_proto::raft::raft_client::RaftClient;
use needlehouse_proto::raft::raft_server::Raft;
use needlehouse_proto::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    LogEntry as WireEntry, VoteRequest, VoteResponse,
};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch, Notify};
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::config::grpc_endpoint;
use crate::consensus::{Command, ConsensusLog, LeaderState, MasterState};
use crate::error::{Error, Result};

/// Snapshot once this many entries have been applied since the last one.
const SNAPSHOT_THRESHOLD: u64 = 1000;

/// How long a proposal waits for commit before giving up.
const PROPOSE_TIMEOUT: Duration = Duration::from_secs(10);

const TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's HTTP address (`ip:port`), also its Raft identity.
    pub address: String,
    /// Voting members' HTTP addresses. May omit `address` (learner mode).
    pub peers: Vec<String>,
    pub meta_dir: PathBuf,
    /// Base election timeout; each deadline is drawn from `[t, 2t)`.
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl RaftConfig {
    pub fn new(address: &str, peers: Vec<String>, meta_dir: PathBuf) -> Self {
        Self {
            address: address.to_string(),
            peers,
            meta_dir,
            election_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogEntry {
    index: u64,
    term: u64,
    command: Command,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetaFile {
    current_term: u64,
    voted_for: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotFile {
    last_included_index: u64,
    last_included_term: u64,
    state: MasterState,
}

struct RaftInner {
    role: Role,
    current_term: u64,
    voted_for: Option<String>,
    leader: Option<String>,

    /// Entries after the snapshot, ordered by index.
    entries: Vec<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,
    snapshot_state: MasterState,

    commit_index: u64,
    last_applied: u64,
    applied: MasterState,
    applied_since_snapshot: u64,

    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    election_deadline: Instant,
    waiters: HashMap<u64, oneshot::Sender<MasterState>>,
}

impl RaftInner {
    fn last_log_index(&self) -> u64 {
        self.snapshot_index + self.entries.len() as u64
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        if index <= self.snapshot_index {
            return None; // compacted away
        }
        self.entries
            .get((index - self.snapshot_index - 1) as usize)
            .map(|e| e.term)
    }

    fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.snapshot_index - 1) as usize)
    }

    fn last_log_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }
}

pub struct RaftNode {
    config: RaftConfig,
    /// Whether this node is in the voter set.
    is_voter: bool,
    inner: Arc<Mutex<RaftInner>>,
    leadership: watch::Sender<LeaderState>,
    replicate: Arc<Notify>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl RaftNode {
    /// Load durable state and build the node. Call [`RaftNode::start`] to
    /// spawn the election and replication tasks.
    pub fn open(config: RaftConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.meta_dir)?;
        let meta: MetaFile = read_json(&config.meta_dir.join("raft_meta.json"))?.unwrap_or_default();
        let snapshot: SnapshotFile =
            read_json(&config.meta_dir.join("raft_snapshot.json"))?.unwrap_or_default();
        let entries = read_log(&config.meta_dir.join("raft_log.jsonl"), snapshot.last_included_index)?;

        let is_voter = config.peers.is_empty() || config.peers.contains(&config.address);
        if !is_voter {
            warn!(
                address = %config.address,
                "local address not in master.peers; joining as non-voting learner"
            );
        }

        let inner = RaftInner {
            role: Role::Follower,
            current_term: meta.current_term,
            voted_for: meta.voted_for,
            leader: None,
            entries,
            snapshot_index: snapshot.last_included_index,
            snapshot_term: snapshot.last_included_term,
            snapshot_state: snapshot.state,
            commit_index: snapshot.last_included_index,
            last_applied: snapshot.last_included_index,
            applied: snapshot.state,
            applied_since_snapshot: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            election_deadline: Instant::now() + randomized(config.election_timeout),
            waiters: HashMap::new(),
        };
        let (leadership, _) = watch::channel(LeaderState::default());
        info!(
            address = %config.address,
            term = inner.current_term,
            log_len = inner.entries.len(),
            snapshot_index = inner.snapshot_index,
            "raft node opened"
        );
        Ok(Arc::new(Self {
            config,
            is_voter,
            inner: Arc::new(Mutex::new(inner)),
            leadership,
            replicate: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn the election ticker and the leader replication loop.
    pub fn start(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(TICK).await;
                node.election_tick().await;
            }
        });
        let node = Arc::clone(self);
        let replicator = tokio::spawn(async move {
            loop {
                let notified = node.replicate.notified();
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(node.config.heartbeat_interval) => {}
                }
                if node.inner.lock().role == Role::Leader {
                    node.replicate_round();
                }
            }
        });
        self.tasks.lock().extend([ticker, replicator]);
    }

    /// Abort the background tasks; the node stops campaigning and
    /// replicating but still answers RPCs it receives.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let mut inner = self.inner.lock();
        inner.role = Role::Follower;
        inner.waiters.clear();
    }

    /// Voting members other than this node.
    fn other_voters(&self) -> Vec<String> {
        self.config
            .peers
            .iter()
            .filter(|p| **p != self.config.address)
            .cloned()
            .collect()
    }

    fn majority(&self) -> usize {
        self.config.peers.len().max(1) / 2 + 1
    }

    async fn election_tick(self: &Arc<Self>) {
        let start = {
            let inner = self.inner.lock();
            self.is_voter
                && inner.role != Role::Leader
                && Instant::now() >= inner.election_deadline
        };
        if start {
            self.start_election().await;
        }
    }

    async fn start_election(self: &Arc<Self>) {
        let (term, last_log_index, last_log_term) = {
            let mut inner = self.inner.lock();
            inner.role = Role::Candidate;
            inner.current_term += 1;
            inner.voted_for = Some(self.config.address.clone());
            inner.leader = None;
            inner.election_deadline = Instant::now() + randomized(self.config.election_timeout);
            self.persist_meta(&inner);
            (inner.current_term, inner.last_log_index(), inner.last_log_term())
        };
        debug!(address = %self.config.address, term, "starting election");

        let mut votes = 1usize; // own vote
        if votes >= self.majority() {
            self.become_leader(term);
            return;
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for peer in self.other_voters() {
            let tx = tx.clone();
            let request = VoteRequest {
                term,
                candidate_id: self.config.address.clone(),
                last_log_index,
                last_log_term,
            };
            tokio::spawn(async move {
                let endpoint = grpc_endpoint(&peer);
                let response = async {
                    let mut client = RaftClient::connect(endpoint).await?;
                    Ok::<_, Error>(client.request_vote(request).await?.into_inner())
                }
                .await;
                let _ = tx.send(response);
            });
        }
        drop(tx);

        let deadline = tokio::time::Instant::now() + self.config.election_timeout;
        while let Ok(Some(response)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            let Ok(vote) = response else { continue };
            if vote.term > term {
                self.step_down(vote.term, None);
                return;
            }
            if vote.vote_granted {
                votes += 1;
                if votes >= self.majority() {
                    self.become_leader(term);
                    return;
                }
            }
        }
        debug!(address = %self.config.address, term, votes, "election did not reach majority");
    }

    fn become_leader(self: &Arc<Self>, term: u64) {
        {
            let mut inner = self.inner.lock();
            if inner.role != Role::Candidate || inner.current_term != term {
                return;
            }
            inner.role = Role::Leader;
            inner.leader = Some(self.config.address.clone());
            let next = inner.last_log_index() + 1;
            inner.next_index = self
                .other_voters()
                .into_iter()
                .map(|p| (p, next))
                .collect();
            inner.match_index = self.other_voters().into_iter().map(|p| (p, 0)).collect();
            info!(address = %self.config.address, term, "became leader");
        }
        self.publish_leadership();

        // Committing an entry of the new term is what lets the leader
        // learn the commit frontier of earlier terms.
        let node = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = node.propose(Command::Noop).await {
                warn!(error = %err, "no-op proposal after election failed");
            }
        });
        self.replicate.notify_waiters();
    }

    fn step_down(self: &Arc<Self>, term: u64, leader: Option<String>) {
        {
            let mut inner = self.inner.lock();
            if term > inner.current_term {
                inner.current_term = term;
                inner.voted_for = None;
                self.persist_meta(&inner);
            }
            inner.role = Role::Follower;
            inner.leader = leader;
            inner.election_deadline = Instant::now() + randomized(self.config.election_timeout);
            inner.waiters.clear();
        }
        self.publish_leadership();
    }

    fn publish_leadership(&self) {
        let inner = self.inner.lock();
        let state = LeaderState {
            is_leader: inner.role == Role::Leader,
            leader: inner.leader.clone(),
        };
        drop(inner);
        let _ = self.leadership.send(state);
    }

    /// One replication fan-out to every peer.
    fn replicate_round(self: &Arc<Self>) {
        for peer in self.other_voters() {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                node.replicate_to(&peer).await;
            });
        }
        // A single-voter cluster has nobody to talk to; commits happen at
        // propose time.
    }

    async fn replicate_to(self: &Arc<Self>, peer: &str) {
        enum Payload {
            Entries(AppendEntriesRequest),
            Snapshot(InstallSnapshotRequest),
        }
        let payload = {
            let inner = self.inner.lock();
            if inner.role != Role::Leader {
                return;
            }
            let next = *inner
                .next_index
                .get(peer)
                .unwrap_or(&(inner.last_log_index() + 1));
            if next <= inner.snapshot_index {
                Payload::Snapshot(InstallSnapshotRequest {
                    term: inner.current_term,
                    leader_id: self.config.address.clone(),
                    last_included_index: inner.snapshot_index,
                    last_included_term: inner.snapshot_term,
                    data: serde_json::to_vec(&inner.snapshot_state).unwrap_or_default(),
                })
            } else {
                let prev_log_index = next - 1;
                let Some(prev_log_term) = inner.term_at(prev_log_index) else {
                    return;
                };
                let entries = inner
                    .entries
                    .iter()
                    .skip((next - inner.snapshot_index - 1) as usize)
                    .map(|e| WireEntry {
                        index: e.index,
                        term: e.term,
                        command: serde_json::to_vec(&e.command).unwrap_or_default(),
                    })
                    .collect();
                Payload::Entries(AppendEntriesRequest {
                    term: inner.current_term,
                    leader_id: self.config.address.clone(),
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: inner.commit_index,
                })
            }
        };

        let endpoint = grpc_endpoint(peer);
        match payload {
            Payload::Entries(request) => {
                let sent_up_to = request
                    .entries
                    .last()
                    .map(|e| e.index)
                    .unwrap_or(request.prev_log_index);
                let response = async {
                    let mut client = RaftClient::connect(endpoint).await?;
                    Ok::<_, Error>(client.append_entries(request).await?.into_inner())
                }
                .await;
                match response {
                    Ok(reply) => self.handle_append_reply(peer, sent_up_to, reply),
                    Err(err) => debug!(peer, error = %err, "append entries failed"),
                }
            }
            Payload::Snapshot(request) => {
                let snapshot_index = request.last_included_index;
                let response = async {
                    let mut client = RaftClient::connect(endpoint).await?;
                    Ok::<_, Error>(client.install_snapshot(request).await?.into_inner())
                }
                .await;
                match response {
                    Ok(reply) => {
                        if reply.term > self.inner.lock().current_term {
                            self.step_down(reply.term, None);
                        } else {
                            let mut inner = self.inner.lock();
                            inner.next_index.insert(peer.to_string(), snapshot_index + 1);
                            inner.match_index.insert(peer.to_string(), snapshot_index);
                        }
                    }
                    Err(err) => debug!(peer, error = %err, "install snapshot failed"),
                }
            }
        }
    }

    fn handle_append_reply(self: &Arc<Self>, peer: &str, sent_up_to: u64, reply: AppendEntriesResponse) {
        let stepped_down = {
            let inner = self.inner.lock();
            reply.term > inner.current_term
        };
        if stepped_down {
            self.step_down(reply.term, None);
            return;
        }
        let mut inner = self.inner.lock();
        if inner.role != Role::Leader {
            return;
        }
        if reply.success {
            inner.match_index.insert(peer.to_string(), sent_up_to);
            inner.next_index.insert(peer.to_string(), sent_up_to + 1);
            self.advance_commit(&mut inner);
        } else {
            // Back off toward the follower's actual log end.
            let next = inner.next_index.entry(peer.to_string()).or_insert(1);
            *next = (*next - 1).clamp(1, reply.match_index + 1);
        }
    }

    fn advance_commit(&self, inner: &mut RaftInner) {
        let last = inner.last_log_index();
        for n in ((inner.commit_index + 1)..=last).rev() {
            if inner.term_at(n) != Some(inner.current_term) {
                continue;
            }
            let replicated = 1 + inner
                .match_index
                .values()
                .filter(|m| **m >= n)
                .count();
            if replicated >= self.majority() {
                inner.commit_index = n;
                self.apply_committed(inner);
                break;
            }
        }
    }

    fn apply_committed(&self, inner: &mut RaftInner) {
        while inner.last_applied < inner.commit_index {
            let next = inner.last_applied + 1;
            let Some(entry) = inner.entry_at(next) else { break };
            let command = entry.command.clone();
            inner.applied.apply(&command);
            inner.last_applied = next;
            inner.applied_since_snapshot += 1;
            if let Some(waiter) = inner.waiters.remove(&next) {
                let _ = waiter.send(inner.applied);
            }
        }
        if inner.applied_since_snapshot >= SNAPSHOT_THRESHOLD {
            if let Err(err) = self.take_snapshot(inner) {
                warn!(error = %err, "snapshot failed");
            }
        }
    }

    fn take_snapshot(&self, inner: &mut RaftInner) -> Result<()> {
        let index = inner.last_applied;
        let Some(term) = inner.term_at(index) else {
            return Ok(());
        };
        write_json(
            &self.config.meta_dir.join("raft_snapshot.json"),
            &SnapshotFile {
                last_included_index: index,
                last_included_term: term,
                state: inner.applied,
            },
        )?;
        inner.entries.retain(|e| e.index > index);
        inner.snapshot_index = index;
        inner.snapshot_term = term;
        inner.snapshot_state = inner.applied;
        inner.applied_since_snapshot = 0;
        self.rewrite_log(inner)?;
        info!(index, "raft snapshot taken");
        Ok(())
    }

    fn persist_meta(&self, inner: &RaftInner) {
        let meta = MetaFile {
            current_term: inner.current_term,
            voted_for: inner.voted_for.clone(),
        };
        if let Err(err) = write_json(&self.config.meta_dir.join("raft_meta.json"), &meta) {
            warn!(error = %err, "failed to persist raft meta");
        }
    }

    fn append_log(&self, entry: &LogEntry) -> Result<()> {
        let path = self.config.meta_dir.join("raft_log.jsonl");
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        serde_json::to_writer(&mut file, entry)
            .map_err(|err| Error::Internal(err.to_string()))?;
        file.write_all(b"\n")?;
        file.sync_data()?;
        Ok(())
    }

    fn rewrite_log(&self, inner: &RaftInner) -> Result<()> {
        let path = self.config.meta_dir.join("raft_log.jsonl");
        let tmp = self.config.meta_dir.join("raft_log.jsonl.tmp");
        let mut file = File::create(&tmp)?;
        for entry in &inner.entries {
            serde_json::to_writer(&mut file, entry)
                .map_err(|err| Error::Internal(err.to_string()))?;
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[async_trait]
impl ConsensusLog for RaftNode {
    async fn propose(&self, command: Command) -> Result<MasterState> {
        let (rx, single_voter_result) = {
            let mut inner = self.inner.lock();
            if inner.role != Role::Leader {
                return Err(Error::NotLeader(inner.leader.clone()));
            }
            let index = inner.last_log_index() + 1;
            let entry = LogEntry {
                index,
                term: inner.current_term,
                command,
            };
            self.append_log(&entry)?;
            inner.entries.push(entry);

            if self.config.peers.len() <= 1 {
                // No followers to wait for.
                inner.commit_index = index;
                self.apply_committed(&mut inner);
                (None, Some(inner.applied))
            } else {
                let (tx, rx) = oneshot::channel();
                inner.waiters.insert(index, tx);
                (Some(rx), None)
            }
        };
        if let Some(state) = single_voter_result {
            return Ok(state);
        }
        self.replicate.notify_waiters();

        let rx = rx.expect("waiter registered");
        match tokio::time::timeout(PROPOSE_TIMEOUT, rx).await {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(_)) => Err(Error::Consensus("leadership lost before commit".into())),
            Err(_) => Err(Error::Consensus("commit timed out".into())),
        }
    }

    fn applied_state(&self) -> MasterState {
        self.inner.lock().applied
    }

    fn is_leader(&self) -> bool {
        self.inner.lock().role == Role::Leader
    }

    fn leader_hint(&self) -> Option<String> {
        self.inner.lock().leader.clone()
    }

    fn subscribe_leadership(&self) -> watch::Receiver<LeaderState> {
        self.leadership.subscribe()
    }
}

/// gRPC surface of one Raft node.
pub struct RaftService {
    node: Arc<RaftNode>,
}

impl RaftService {
    pub fn new(node: Arc<RaftNode>) -> Self {
        Self { node }
    }
}

#[tonic::async_trait]
impl Raft for RaftService {
    async fn request_vote(
        &self,
        request: Request<VoteRequest>,
    ) -> std::result::Result<Response<VoteResponse>, Status> {
        let request = request.into_inner();
        let node = &self.node;
        let mut inner = node.inner.lock();

        if request.term > inner.current_term {
            inner.current_term = request.term;
            inner.voted_for = None;
            inner.role = Role::Follower;
            node.persist_meta(&inner);
        }
        let log_ok = request.last_log_term > inner.last_log_term()
            || (request.last_log_term == inner.last_log_term()
                && request.last_log_index >= inner.last_log_index());
        let grant = request.term >= inner.current_term
            && log_ok
            && inner
                .voted_for
                .as_ref()
                .map(|v| *v == request.candidate_id)
                .unwrap_or(true);
        if grant {
            inner.voted_for = Some(request.candidate_id.clone());
            inner.election_deadline =
                Instant::now() + randomized(node.config.election_timeout);
            node.persist_meta(&inner);
        }
        debug!(
            candidate = %request.candidate_id,
            term = request.term,
            grant,
            "vote requested"
        );
        Ok(Response::new(VoteResponse {
            term: inner.current_term,
            vote_granted: grant,
        }))
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> std::result::Result<Response<AppendEntriesResponse>, Status> {
        let request = request.into_inner();
        let node = &self.node;
        let (response, leader_changed) = {
            let mut inner = node.inner.lock();
            if request.term < inner.current_term {
                return Ok(Response::new(AppendEntriesResponse {
                    term: inner.current_term,
                    success: false,
                    match_index: inner.last_log_index(),
                }));
            }
            let leader_changed = inner.leader.as_deref() != Some(request.leader_id.as_str())
                || inner.role != Role::Follower;
            if request.term > inner.current_term {
                inner.current_term = request.term;
                inner.voted_for = None;
                node.persist_meta(&inner);
            }
            inner.role = Role::Follower;
            inner.leader = Some(request.leader_id.clone());
            inner.election_deadline = Instant::now() + randomized(node.config.election_timeout);

            // Consistency check on the entry preceding the new ones.
            if inner.term_at(request.prev_log_index) != Some(request.prev_log_term) {
                return Ok(Response::new(AppendEntriesResponse {
                    term: inner.current_term,
                    success: false,
                    match_index: inner.last_log_index().min(request.prev_log_index.saturating_sub(1)),
                }));
            }

            let mut dirty = false;
            for wire in &request.entries {
                if wire.index <= inner.snapshot_index {
                    continue; // already compacted into the snapshot
                }
                let command: Command = serde_json::from_slice(&wire.command)
                    .map_err(|err| Status::invalid_argument(err.to_string()))?;
                match inner.term_at(wire.index) {
                    Some(term) if term == wire.term => continue, // already have it
                    Some(_) => {
                        // Conflict: drop our suffix from here on.
                        inner
                            .entries
                            .retain(|e| e.index < wire.index);
                        dirty = true;
                    }
                    None => {}
                }
                inner.entries.push(LogEntry {
                    index: wire.index,
                    term: wire.term,
                    command,
                });
                if !dirty {
                    let entry = inner.entries.last().expect("just pushed").clone();
                    if let Err(err) = node.append_log(&entry) {
                        warn!(error = %err, "failed to append raft log");
                    }
                }
            }
            if dirty {
                if let Err(err) = node.rewrite_log(&inner) {
                    warn!(error = %err, "failed to rewrite raft log");
                }
            }

            let new_commit = request.leader_commit.min(inner.last_log_index());
            if new_commit > inner.commit_index {
                inner.commit_index = new_commit;
                node.apply_committed(&mut inner);
            }
            let response = AppendEntriesResponse {
                term: inner.current_term,
                success: true,
                match_index: inner.last_log_index(),
            };
            (response, leader_changed)
        };
        if leader_changed {
            node.publish_leadership();
        }
        Ok(Response::new(response))
    }

    async fn install_snapshot(
        &self,
        request: Request<InstallSnapshotRequest>,
    ) -> std::result::Result<Response<InstallSnapshotResponse>, Status> {
        let request = request.into_inner();
        let node = &self.node;
        let mut inner = node.inner.lock();
        if request.term < inner.current_term {
            return Ok(Response::new(InstallSnapshotResponse {
                term: inner.current_term,
            }));
        }
        if request.term > inner.current_term {
            inner.current_term = request.term;
            inner.voted_for = None;
            node.persist_meta(&inner);
        }
        inner.role = Role::Follower;
        inner.leader = Some(request.leader_id.clone());
        inner.election_deadline = Instant::now() + randomized(node.config.election_timeout);

        if request.last_included_index <= inner.snapshot_index {
            return Ok(Response::new(InstallSnapshotResponse {
                term: inner.current_term,
            }));
        }
        let state: MasterState = serde_json::from_slice(&request.data)
            .map_err(|err| Status::invalid_argument(err.to_string()))?;
        inner.entries.retain(|e| e.index > request.last_included_index);
        inner.snapshot_index = request.last_included_index;
        inner.snapshot_term = request.last_included_term;
        inner.snapshot_state = state;
        inner.applied = state;
        inner.last_applied = request.last_included_index;
        inner.commit_index = inner.commit_index.max(request.last_included_index);
        if let Err(err) = write_json(
            &node.config.meta_dir.join("raft_snapshot.json"),
            &SnapshotFile {
                last_included_index: request.last_included_index,
                last_included_term: request.last_included_term,
                state,
            },
        ) {
            warn!(error = %err, "failed to persist installed snapshot");
        }
        if let Err(err) = node.rewrite_log(&inner) {
            warn!(error = %err, "failed to rewrite raft log after snapshot");
        }
        info!(
            index = request.last_included_index,
            "installed snapshot from leader"
        );
        Ok(Response::new(InstallSnapshotResponse {
            term: inner.current_term,
        }))
    }
}

fn randomized(base: Duration) -> Duration {
    let millis = base.as_millis().max(1) as u64;
    Duration::from_millis(millis + rand::thread_rng().gen_range(0..millis))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &std::path::Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| Error::Internal(format!("{}: {}", path.display(), err))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn write_json<T: Serialize>(path: &std::path::Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    serde_json::to_writer_pretty(&mut file, value)
        .map_err(|err| Error::Internal(err.to_string()))?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_log(path: &std::path::Path, after_index: u64) -> Result<Vec<LogEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        // A torn trailing line (crash mid-append) ends the log.
        let Ok(entry) = serde_json::from_str::<LogEntry>(&line) else {
            warn!("ignoring torn trailing raft log entry");
            break;
        };
        entries.push(entry);
    }
    entries.retain(|e| e.index > after_index);
    Ok(entries)
}
