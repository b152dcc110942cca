//! The replica: role state machine, elections, replication and commit
//! advancement over one active segment.
//!
//! A node runs a ticker task (election timeouts, leader heartbeats), a
//! single applier task feeding the state machine, and short-lived
//! spawned tasks for outbound RPCs and the follower's inbound entry
//! stream. One coarse mutex guards the replica fields; it is only held
//! for bounded work, never across awaits.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use async_trait::async_trait;

use super::cluster::{ClusterConfig, Peer};
use super::clock::{Clock, OsRandom, RandomSource, SystemClock};
use super::entry::{self, EntryKind, LogEntry};
use super::error::{Error, Result};
use super::segment::{Segment, SegmentStore};
use super::transport::{
    HeartbeatRequest, HeartbeatResponse, RaftRpc, Transport, VoteRequest, VoteResponse,
};
use super::{Role, StateMachine};
use crate::metrics;

const ID_FILE: &str = "id";
const TERM_FILE: &str = "term";
const LOCK_FILE: &str = "lock";
const SEGMENT_FILE: &str = "1.log";

/// Granularity of the timer loop.
const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Tunables and identity advertised by this replica.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// URL peers use to reach this node. Required for `initialize`.
    pub url: Option<String>,
    /// Cadence of leader heartbeats.
    pub heartbeat_timeout: Duration,
    /// Base follower election timeout; the effective timeout adds a
    /// random jitter in `[0, election_timeout)`.
    pub election_timeout: Duration,
}

impl Default for NodeOptions {
    fn default() -> NodeOptions {
        NodeOptions {
            url: None,
            heartbeat_timeout: Duration::from_millis(50),
            election_timeout: Duration::from_millis(150),
        }
    }
}

/// A replicated log node. Construct with [`Node::new`] (inside a tokio
/// runtime), then [`Node::open`] a data directory.
pub struct Node {
    shared: Arc<Shared>,
    drop_tx: watch::Sender<bool>,
}

struct Shared {
    options: NodeOptions,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    rand: Arc<dyn RandomSource>,
    state: Mutex<State>,
    // Serializes appends end to end (index reservation through segment
    // write) so the file I/O can run without the state lock held.
    append_mu: tokio::sync::Mutex<()>,
    commit_tx: watch::Sender<u64>,
    applied_tx: watch::Sender<u64>,
    shutdown_tx: watch::Sender<bool>,
    // Bumped whenever the inbound reader changes hands; the old
    // read_from loop sees the new epoch and bows out.
    reader_tx: watch::Sender<u64>,
}

struct State {
    path: Option<PathBuf>,
    id: u64,
    role: Role,
    config: Option<ClusterConfig>,
    current_term: u64,
    voted_for: Option<u64>,
    leader_id: Option<u64>,
    current_index: u64,
    commit_index: u64,
    applied_index: u64,
    next_index: HashMap<u64, u64>,
    match_index: HashMap<u64, u64>,
    segment: Option<Arc<dyn SegmentStore>>,
    election_deadline: Instant,
    // Incremented per open so a ticker from a previous session stops.
    session: u64,
    puller_active: bool,
}

/// Work the ticker decided on under the lock, executed outside it.
enum TickAction {
    Idle,
    Election,
    Heartbeats(HeartbeatRequest, Vec<Peer>),
    PullStream { url: String, term: u64, from: u64 },
}

impl Node {
    /// Create a node around a state machine, transport, clock and
    /// randomness source. Spawns the applier task.
    pub fn new<M: StateMachine>(
        options: NodeOptions,
        fsm: M,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        rand: Arc<dyn RandomSource>,
    ) -> Node {
        let now = Instant::now();
        let shared = Arc::new(Shared {
            options,
            transport,
            clock,
            rand,
            state: Mutex::new(State {
                path: None,
                id: 0,
                role: Role::Follower,
                config: None,
                current_term: 0,
                voted_for: None,
                leader_id: None,
                current_index: 0,
                commit_index: 0,
                applied_index: 0,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                segment: None,
                election_deadline: now,
                session: 0,
                puller_active: false,
            }),
            append_mu: tokio::sync::Mutex::new(()),
            commit_tx: watch::channel(0).0,
            applied_tx: watch::channel(0).0,
            shutdown_tx: watch::channel(false).0,
            reader_tx: watch::channel(0).0,
        });
        let (drop_tx, drop_rx) = watch::channel(false);
        tokio::spawn(run_applier(shared.clone(), fsm, drop_rx));
        Node { shared, drop_tx }
    }

    /// Node with the production clock and randomness.
    pub fn with_defaults<M: StateMachine>(
        options: NodeOptions,
        fsm: M,
        transport: Arc<dyn Transport>,
    ) -> Node {
        Node::new(
            options,
            fsm,
            transport,
            Arc::new(SystemClock),
            Arc::new(OsRandom),
        )
    }

    /// Handler half for wiring this node into a transport registry.
    pub fn rpc_handler(&self) -> Arc<dyn RaftRpc> {
        self.shared.clone()
    }

    /// Open the data directory, restoring identity, hard state,
    /// membership and the active segment, then start the timers.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<()> {
        self.shared.open(path.as_ref())
    }

    /// Close the node: stops the timers, releases the segment's tail
    /// writers and the inbound reader, drops the directory lock.
    /// Idempotent.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    /// Single-shot bootstrap of a one-member cluster.
    pub async fn initialize(&self) -> Result<()> {
        self.shared.initialize().await
    }

    /// Submit a command. Returns once the entry is committed and
    /// applied. Leader only.
    pub async fn apply(&self, command: Vec<u8>) -> Result<()> {
        self.shared.apply(command).await
    }

    /// Inbound leader heartbeat. Returns `(current_index,
    /// current_term)`.
    pub fn heartbeat(&self, term: u64, commit_index: u64, leader_id: u64) -> Result<(u64, u64)> {
        self.shared.heartbeat(term, commit_index, leader_id)
    }

    /// Inbound vote request. Returns our term on grant.
    pub fn request_vote(
        &self,
        term: u64,
        candidate_id: u64,
        last_log_index: u64,
        last_log_term: u64,
    ) -> Result<u64> {
        self.shared
            .request_vote(term, candidate_id, last_log_index, last_log_term)
    }

    /// Serve the log from `from_index` into `writer`, then keep
    /// streaming appends until the segment seals or the writer fails.
    pub async fn write_to<W>(&self, writer: &mut W, term: u64, from_index: u64) -> Result<()>
    where
        W: AsyncWrite + Send + Unpin,
    {
        self.shared.write_to(writer, term, from_index).await
    }

    /// Install `reader` as the inbound entry stream, replacing any
    /// prior one, and consume it until EOF.
    pub async fn read_from<R>(&self, reader: R) -> Result<()>
    where
        R: AsyncRead + Send + Unpin,
    {
        self.shared.read_from(reader).await
    }

    /// Force an election round. Does not guarantee this node wins.
    pub async fn elect(&self) -> Result<()> {
        self.shared.elect().await
    }

    pub fn state(&self) -> Role {
        self.shared.lock().role
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.shared.lock().path.clone()
    }

    pub fn opened(&self) -> bool {
        self.shared.lock().path.is_some()
    }

    pub fn id(&self) -> u64 {
        self.shared.lock().id
    }

    pub fn leader_id(&self) -> Option<u64> {
        self.shared.lock().leader_id
    }

    pub fn current_term(&self) -> u64 {
        self.shared.lock().current_term
    }

    pub fn current_index(&self) -> u64 {
        self.shared.lock().current_index
    }

    pub fn commit_index(&self) -> u64 {
        self.shared.lock().commit_index
    }

    pub fn applied_index(&self) -> u64 {
        self.shared.lock().applied_index
    }

    pub fn cluster_config(&self) -> Option<ClusterConfig> {
        self.shared.lock().config.clone()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.shared.close();
        let _ = self.drop_tx.send(true);
    }
}

impl State {
    fn opened(&self) -> bool {
        self.path.is_some()
    }

    fn segment(&self) -> Result<Arc<dyn SegmentStore>> {
        self.segment.clone().ok_or(Error::Closed)
    }

    fn last_entry(&self) -> (u64, u64) {
        match self.segment.as_ref().and_then(|s| s.last_index()) {
            Some(index) => {
                let term = self
                    .segment
                    .as_ref()
                    .and_then(|s| s.term_of(index))
                    .unwrap_or(0);
                (index, term)
            }
            None => (0, 0),
        }
    }

    /// Members of the cluster, defaulting to just ourselves before
    /// any membership is known.
    fn members(&self) -> Vec<u64> {
        match &self.config {
            Some(c) => c.nodes.iter().map(|n| n.id).collect(),
            None => vec![self.id],
        }
    }

    fn quorum(&self) -> usize {
        self.members().len() / 2 + 1
    }

    fn peers(&self) -> Vec<Peer> {
        match &self.config {
            Some(c) => c.peers_of(self.id),
            None => Vec::new(),
        }
    }

    fn peer_url(&self, id: u64) -> Option<String> {
        self.config
            .as_ref()
            .and_then(|c| c.nodes.iter().find(|n| n.id == id))
            .map(|n| n.url.clone())
    }

    fn persist_hard_state(&self) -> Result<()> {
        let dir = self.path.as_ref().ok_or(Error::Closed)?;
        let voted = match self.voted_for {
            Some(id) => id.to_string(),
            None => "-".to_string(),
        };
        fs::write(
            dir.join(TERM_FILE),
            format!("{} {}\n", self.current_term, voted),
        )?;
        Ok(())
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reset_election_timer(&self, st: &mut State) {
        let timeout = self.options.election_timeout;
        let jitter_ms = self.rand.next_u64() % (timeout.as_millis().max(1) as u64);
        st.election_deadline = self.clock.now() + timeout + Duration::from_millis(jitter_ms);
    }

    fn step_down(&self, st: &mut State, term: u64) -> Result<()> {
        if term > st.current_term {
            st.current_term = term;
            st.voted_for = None;
            st.persist_hard_state()?;
        }
        if st.role != Role::Follower {
            log::info!(
                "node {} stepping down to follower in term {}",
                st.id,
                st.current_term
            );
            st.role = Role::Follower;
            st.leader_id = None;
        }
        Ok(())
    }

    /// Publish a finished segment append: take the state lock only to
    /// bump `current_index` and recompute the commit frontier. Callers
    /// hold `append_mu` across the whole append, so the index reserved
    /// while deciding is still the segment's next slot.
    fn finish_append(&self, index: u64) {
        let mut st = self.lock();
        st.current_index = index;
        self.advance_commit(&mut st);
        metrics::ENTRIES_APPENDED.inc();
    }

    /// Recompute the commit index from the match indexes. Leader only;
    /// an entry commits once a strict majority has it and it belongs
    /// to the current term.
    fn advance_commit(&self, st: &mut State) {
        if st.role != Role::Leader {
            return;
        }
        let mut acked: Vec<u64> = st
            .members()
            .iter()
            .map(|&id| {
                if id == st.id {
                    st.current_index
                } else {
                    *st.match_index.get(&id).unwrap_or(&0)
                }
            })
            .collect();
        acked.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = acked[st.quorum() - 1];
        if candidate <= st.commit_index {
            return;
        }
        let own_term = st
            .segment
            .as_ref()
            .and_then(|s| s.term_of(candidate))
            .map(|t| t == st.current_term)
            .unwrap_or(false);
        if !own_term {
            return;
        }
        st.commit_index = candidate;
        self.commit_tx.send_replace(candidate);
    }

    fn open(self: &Arc<Self>, dir: &Path) -> Result<()> {
        let mut st = self.lock();
        if st.opened() {
            return Err(Error::AlreadyOpen);
        }
        fs::create_dir_all(dir)?;

        // The directory belongs to exactly one opener.
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(LOCK_FILE))
        {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                log::warn!("data directory {} is locked", dir.display());
                return Err(Error::AlreadyOpen);
            }
            Err(e) => return Err(e.into()),
        }

        st.path = Some(dir.to_path_buf());
        if let Err(e) = self.restore(&mut st, dir) {
            let _ = fs::remove_file(dir.join(LOCK_FILE));
            st.path = None;
            st.segment = None;
            return Err(e);
        }

        st.role = Role::Follower;
        st.leader_id = None;
        st.commit_index = 0;
        st.applied_index = 0;
        st.next_index.clear();
        st.match_index.clear();
        st.puller_active = false;
        st.session += 1;
        self.reset_election_timer(&mut st);

        self.shutdown_tx.send_replace(false);
        self.commit_tx.send_replace(0);
        self.applied_tx.send_replace(0);

        log::info!("node {} opened {}", st.id, dir.display());
        let session = st.session;
        drop(st);
        tokio::spawn(run_ticker(self.clone(), session));
        Ok(())
    }

    /// Restore identity, hard state, membership and the segment.
    fn restore(&self, st: &mut State, dir: &Path) -> Result<()> {
        let id_path = dir.join(ID_FILE);
        st.id = match fs::read_to_string(&id_path) {
            Ok(text) => text
                .trim()
                .parse::<u64>()
                .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let id = self.rand.next_u64();
                fs::write(&id_path, id.to_string())?;
                id
            }
            Err(e) => return Err(e.into()),
        };

        (st.current_term, st.voted_for) = match fs::read_to_string(dir.join(TERM_FILE)) {
            Ok(text) => {
                let mut parts = text.split_whitespace();
                let term = parts.next().and_then(|t| t.parse().ok()).unwrap_or(0);
                let voted = parts.next().and_then(|v| v.parse().ok());
                (term, voted)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (0, None),
            Err(e) => return Err(e.into()),
        };

        st.config = ClusterConfig::load(dir)?;

        let segment = Segment::open(dir.join(SEGMENT_FILE), 1)?;
        st.current_index = segment.last_index().unwrap_or(0);
        if let Some(last) = segment.last_index() {
            if let Some(term) = segment.term_of(last) {
                // The log can be ahead of the term file if we crashed
                // between the two writes; the vote belongs to the
                // older term in that case.
                if term > st.current_term {
                    st.current_term = term;
                    st.voted_for = None;
                }
            }
        }
        st.segment = Some(Arc::new(segment));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut st = self.lock();
        let Some(dir) = st.path.take() else {
            return Ok(());
        };
        if let Some(segment) = st.segment.take() {
            segment.close();
        }
        st.role = Role::Follower;
        st.leader_id = None;
        let _ = fs::remove_file(dir.join(LOCK_FILE));
        drop(st);
        self.shutdown_tx.send_replace(true);
        self.reader_tx.send_modify(|e| *e += 1);
        log::info!("node closed, data at {}", dir.display());
        Ok(())
    }

    async fn initialize(self: &Arc<Self>) -> Result<()> {
        {
            let _append = self.append_mu.lock().await;
            let (segment, entry) = {
                let mut st = self.lock();
                if !st.opened() {
                    return Err(Error::Closed);
                }
                if st.current_index > 0 {
                    return Err(Error::AlreadyInitialized);
                }
                let url = self.options.url.clone().ok_or(Error::UrlRequired)?;

                let config = ClusterConfig::bootstrap(self.rand.next_u64(), st.id, url);
                st.current_term = 1;
                st.role = Role::Leader;
                st.leader_id = Some(st.id);
                st.persist_hard_state()?;
                (
                    st.segment()?,
                    LogEntry::new(EntryKind::Config, 1, 1, config.encode()?),
                )
            };
            segment.append(&entry)?;
            self.finish_append(entry.index);
        }
        self.wait_applied(1).await
    }

    async fn apply(self: &Arc<Self>, command: Vec<u8>) -> Result<()> {
        let index = {
            let _append = self.append_mu.lock().await;
            let (segment, entry) = {
                let st = self.lock();
                if !st.opened() {
                    return Err(Error::Closed);
                }
                if st.role != Role::Leader {
                    return Err(Error::NotLeader);
                }
                let entry = LogEntry::new(
                    EntryKind::Command,
                    st.current_index + 1,
                    st.current_term,
                    command,
                );
                (st.segment()?, entry)
            };
            segment.append(&entry)?;
            self.finish_append(entry.index);
            entry.index
        };
        self.wait_applied(index).await
    }

    /// Block until the applier has passed `index`, or the node closes.
    async fn wait_applied(&self, index: u64) -> Result<()> {
        let mut applied_rx = self.applied_tx.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if *applied_rx.borrow_and_update() >= index {
                return Ok(());
            }
            if *shutdown_rx.borrow_and_update() {
                return Err(Error::Closed);
            }
            tokio::select! {
                res = applied_rx.changed() => {
                    if res.is_err() {
                        return Err(Error::Closed);
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    fn heartbeat(&self, term: u64, commit_index: u64, leader_id: u64) -> Result<(u64, u64)> {
        let mut st = self.lock();
        if !st.opened() {
            return Err(Error::Closed);
        }
        // A stale leader learns our term from the reply; nothing else
        // changes here.
        if term < st.current_term {
            return Ok((st.current_index, st.current_term));
        }
        if term > st.current_term || st.role == Role::Candidate {
            self.step_down(&mut st, term)?;
        }
        st.leader_id = Some(leader_id);
        let capped = commit_index.min(st.current_index);
        if capped > st.commit_index {
            st.commit_index = capped;
            self.commit_tx.send_replace(capped);
        }
        self.reset_election_timer(&mut st);
        Ok((st.current_index, st.current_term))
    }

    fn request_vote(
        &self,
        term: u64,
        candidate_id: u64,
        last_log_index: u64,
        last_log_term: u64,
    ) -> Result<u64> {
        let mut st = self.lock();
        if !st.opened() {
            return Err(Error::Closed);
        }
        if term < st.current_term {
            return Err(Error::StaleTerm);
        }
        if term > st.current_term {
            self.step_down(&mut st, term)?;
        }
        if let Some(voted) = st.voted_for {
            if voted != candidate_id {
                return Err(Error::AlreadyVoted);
            }
        }
        let (our_last_index, our_last_term) = st.last_entry();
        let up_to_date = last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index);
        if !up_to_date {
            return Err(Error::OutOfDateLog);
        }
        st.voted_for = Some(candidate_id);
        st.persist_hard_state()?;
        self.reset_election_timer(&mut st);
        log::info!(
            "node {} voted for {} in term {}",
            st.id,
            candidate_id,
            st.current_term
        );
        Ok(st.current_term)
    }

    async fn write_to<W>(&self, writer: &mut W, term: u64, from_index: u64) -> Result<()>
    where
        W: AsyncWrite + Send + Unpin + ?Sized,
    {
        let segment = {
            let mut st = self.lock();
            if !st.opened() {
                return Err(Error::Closed);
            }
            if term > st.current_term {
                self.step_down(&mut st, term)?;
                return Err(Error::NotLeader);
            }
            if st.role != Role::Leader {
                return Err(Error::NotLeader);
            }
            // Streams may start anywhere in the committed prefix or at
            // the frontier right after it; never beyond.
            if from_index > st.commit_index + 1 {
                return Err(Error::UncommittedIndex);
            }
            st.segment()?
        };
        let mut writer = writer;
        segment.write_to(&mut writer, from_index).await
    }

    async fn read_from<R>(&self, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Send + Unpin,
    {
        {
            let st = self.lock();
            if !st.opened() {
                return Err(Error::Closed);
            }
        }
        let mut epoch = 0;
        self.reader_tx.send_modify(|e| {
            *e += 1;
            epoch = *e;
        });
        let mut epoch_rx = self.reader_tx.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let decoded = tokio::select! {
                decoded = entry::decode_from_async(&mut reader) => decoded,
                _ = epoch_rx.changed() => {
                    if *epoch_rx.borrow() != epoch {
                        // A newer stream took over.
                        return Ok(());
                    }
                    continue;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Ok(());
                    }
                    continue;
                }
            };
            let Some(e) = decoded? else {
                return Ok(());
            };
            if !self.append_streamed(epoch, e).await? {
                // A newer stream took over mid-append.
                return Ok(());
            }
        }
    }

    /// Append one entry arriving from the leader, reconciling overlap
    /// with what we already hold. Decisions happen under the state
    /// lock; the segment I/O itself runs outside it, serialized by
    /// `append_mu`. Returns `false` when this stream was superseded.
    async fn append_streamed(&self, epoch: u64, e: LogEntry) -> Result<bool> {
        let _append = self.append_mu.lock().await;
        let (segment, conflict) = {
            let st = self.lock();
            if !st.opened() {
                return Err(Error::Closed);
            }
            if *self.reader_tx.borrow() != epoch {
                return Ok(false);
            }
            let mut conflict = false;
            if e.index <= st.current_index {
                let existing = st.segment()?.term_of(e.index);
                if existing == Some(e.term) {
                    // Already have it; the leader restarted the stream.
                    return Ok(true);
                }
                // Conflicting suffix. Committed entries are untouchable.
                if e.index <= st.commit_index {
                    log::error!(
                        "stream conflicts with committed entry {} (term {:?} vs {})",
                        e.index,
                        existing,
                        e.term
                    );
                    return Err(Error::OutOfRange);
                }
                log::warn!(
                    "truncating conflicting suffix from index {} (term {:?} vs {})",
                    e.index,
                    existing,
                    e.term
                );
                conflict = true;
            } else if e.index != st.current_index + 1 {
                log::error!(
                    "stream skipped from index {} to {}",
                    st.current_index,
                    e.index
                );
                return Err(Error::OutOfRange);
            }
            (st.segment()?, conflict)
        };

        if conflict {
            segment.truncate(e.index)?;
            self.lock().current_index = e.index - 1;
        }
        segment.append(&e)?;
        self.finish_append(e.index);
        Ok(true)
    }

    async fn elect(self: &Arc<Self>) -> Result<()> {
        let (req, peers, quorum, term) = {
            let mut st = self.lock();
            if !st.opened() {
                return Err(Error::Closed);
            }
            st.role = Role::Candidate;
            st.leader_id = None;
            st.current_term += 1;
            st.voted_for = Some(st.id);
            st.persist_hard_state()?;
            self.reset_election_timer(&mut st);
            let (last_log_index, last_log_term) = st.last_entry();
            log::info!(
                "node {} starting election for term {}",
                st.id,
                st.current_term
            );
            (
                VoteRequest {
                    term: st.current_term,
                    candidate_id: st.id,
                    last_log_index,
                    last_log_term,
                },
                st.peers(),
                st.quorum(),
                st.current_term,
            )
        };
        metrics::ELECTIONS_STARTED.inc();
        // Cancel any inbound stream from the previous leader.
        self.reader_tx.send_modify(|e| *e += 1);

        let mut granted = 1usize; // our own vote
        if granted < quorum {
            let (tx, mut rx) = mpsc::channel(peers.len().max(1));
            for peer in peers {
                let transport = self.transport.clone();
                let req = req.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let res = transport.request_vote(&peer.url, req).await;
                    let _ = tx.send((peer.id, res)).await;
                });
            }
            drop(tx);

            let decision_window = self.clock.sleep(self.options.election_timeout);
            tokio::pin!(decision_window);
            loop {
                tokio::select! {
                    _ = &mut decision_window => break,
                    received = rx.recv() => match received {
                        None => break,
                        Some((_, Ok(resp))) => {
                            if resp.granted {
                                granted += 1;
                                if granted >= quorum {
                                    break;
                                }
                            } else if resp.term > term {
                                let mut st = self.lock();
                                self.step_down(&mut st, resp.term)?;
                                return Ok(());
                            }
                        }
                        Some((peer_id, Err(e))) => {
                            log::debug!("vote request to {} failed: {}", peer_id, e);
                        }
                    }
                }
            }
        }

        let _append = self.append_mu.lock().await;
        let won = {
            let mut st = self.lock();
            if granted >= quorum && st.role == Role::Candidate && st.current_term == term {
                Some(self.become_leader(&mut st)?)
            } else {
                None
            }
        };
        if let Some((segment, nop)) = won {
            segment.append(&nop)?;
            self.finish_append(nop.index);
        }
        Ok(())
    }

    /// Flip to Leader under the state lock and plan the no-op append;
    /// the caller performs the segment write outside the lock.
    fn become_leader(&self, st: &mut State) -> Result<(Arc<dyn SegmentStore>, LogEntry)> {
        st.role = Role::Leader;
        st.leader_id = Some(st.id);
        let next = st.current_index + 1;
        st.next_index = st.peers().iter().map(|p| (p.id, next)).collect();
        st.match_index = st.peers().iter().map(|p| (p.id, 0)).collect();
        log::info!("node {} elected leader for term {}", st.id, st.current_term);

        // A no-op of our own term lets the commit rule advance over
        // entries inherited from earlier terms.
        let nop = LogEntry::new(
            EntryKind::Nop,
            st.current_index + 1,
            st.current_term,
            Vec::new(),
        );
        Ok((st.segment()?, nop))
    }

    fn on_heartbeat_ack(&self, peer_id: u64, resp: HeartbeatResponse) {
        let mut st = self.lock();
        if !st.opened() {
            return;
        }
        if resp.current_term > st.current_term {
            if let Err(e) = self.step_down(&mut st, resp.current_term) {
                log::warn!("step down failed: {}", e);
            }
            return;
        }
        if st.role != Role::Leader {
            return;
        }
        let matched = resp.current_index.min(st.current_index);
        let known = st.match_index.entry(peer_id).or_insert(0);
        if matched > *known {
            *known = matched;
        }
        st.next_index.insert(peer_id, matched + 1);
        self.advance_commit(&mut st);
    }

    /// One pass of the timer loop: decide under the lock, act outside.
    /// `None` ends the ticker.
    fn tick_action(&self, session: u64, next_heartbeat: &mut Instant) -> Option<TickAction> {
        let mut st = self.lock();
        if !st.opened() || st.session != session {
            return None;
        }
        let now = self.clock.now();
        match st.role {
            Role::Leader => {
                if now >= *next_heartbeat {
                    *next_heartbeat = now + self.options.heartbeat_timeout;
                    let req = HeartbeatRequest {
                        term: st.current_term,
                        commit_index: st.commit_index,
                        leader_id: st.id,
                    };
                    let peers = st.peers();
                    if !peers.is_empty() {
                        return Some(TickAction::Heartbeats(req, peers));
                    }
                }
                Some(TickAction::Idle)
            }
            Role::Candidate | Role::Follower => {
                if now >= st.election_deadline {
                    return Some(TickAction::Election);
                }
                if st.role == Role::Follower && !st.puller_active {
                    if let Some(leader) = st.leader_id.filter(|&l| l != st.id) {
                        if let Some(url) = st.peer_url(leader) {
                            st.puller_active = true;
                            return Some(TickAction::PullStream {
                                url,
                                term: st.current_term,
                                from: st.current_index + 1,
                            });
                        }
                    }
                }
                Some(TickAction::Idle)
            }
        }
    }

    fn send_heartbeats(self: &Arc<Self>, req: HeartbeatRequest, peers: Vec<Peer>) {
        for peer in peers {
            let shared = self.clone();
            let req = req.clone();
            tokio::spawn(async move {
                metrics::HEARTBEATS_SENT.inc();
                match shared.transport.heartbeat(&peer.url, req).await {
                    Ok(resp) => shared.on_heartbeat_ack(peer.id, resp),
                    Err(e) => log::debug!("heartbeat to {} failed: {}", peer.id, e),
                }
            });
        }
    }

    fn pull_stream(self: &Arc<Self>, url: String, term: u64, from: u64) {
        let shared = self.clone();
        tokio::spawn(async move {
            match shared.transport.stream(&url, term, from).await {
                Ok(reader) => {
                    if let Err(e) = shared.read_from(reader).await {
                        log::debug!("inbound stream from {} ended: {}", url, e);
                    }
                }
                Err(e) => log::debug!("stream connect to {} failed: {}", url, e),
            }
            shared.lock().puller_active = false;
        });
    }
}

/// Inbound RPC face used by transports.
#[async_trait]
impl RaftRpc for Shared {
    async fn vote(&self, req: VoteRequest) -> VoteResponse {
        match self.request_vote(
            req.term,
            req.candidate_id,
            req.last_log_index,
            req.last_log_term,
        ) {
            Ok(term) => VoteResponse {
                term,
                granted: true,
            },
            Err(e) => {
                log::debug!("vote denied for {}: {}", req.candidate_id, e);
                VoteResponse {
                    term: self.lock().current_term,
                    granted: false,
                }
            }
        }
    }

    async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse> {
        let (current_index, current_term) =
            Shared::heartbeat(self, req.term, req.commit_index, req.leader_id)?;
        Ok(HeartbeatResponse {
            current_index,
            current_term,
        })
    }

    async fn stream_to(
        &self,
        term: u64,
        from_index: u64,
        mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Result<()> {
        self.write_to(&mut *writer, term, from_index).await
    }
}

/// Election and heartbeat timer loop, one per open session.
async fn run_ticker(shared: Arc<Shared>, session: u64) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut next_heartbeat = shared.clock.now();
    loop {
        tokio::select! {
            _ = shared.clock.sleep(TICK_INTERVAL) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
                continue;
            }
        }
        match shared.tick_action(session, &mut next_heartbeat) {
            None => return,
            Some(TickAction::Idle) => {}
            Some(TickAction::Election) => {
                if let Err(e) = shared.elect().await {
                    log::warn!("election failed: {}", e);
                }
            }
            Some(TickAction::Heartbeats(req, peers)) => shared.send_heartbeats(req, peers),
            Some(TickAction::PullStream { url, term, from }) => {
                shared.pull_stream(url, term, from)
            }
        }
    }
}

/// The single applier: walks `(applied_index, commit_index]` in order,
/// feeding the state machine. Lives for the node's lifetime.
async fn run_applier<M: StateMachine>(
    shared: Arc<Shared>,
    mut fsm: M,
    mut drop_rx: watch::Receiver<bool>,
) {
    let mut commit_rx = shared.commit_tx.subscribe();
    loop {
        loop {
            let (next, segment, dir) = {
                let st = shared.lock();
                if !st.opened() || st.applied_index >= st.commit_index {
                    break;
                }
                let Ok(segment) = st.segment() else { break };
                (st.applied_index + 1, segment, st.path.clone())
            };
            let entry = match segment.entry(next) {
                Ok(e) => e,
                Err(e) => {
                    log::error!("cannot read committed entry {}: {}", next, e);
                    break;
                }
            };
            match entry.kind {
                EntryKind::Command => {
                    if let Err(e) = fsm.apply(&entry) {
                        log::error!("state machine failed at {}: {}; shutting down", next, e);
                        let _ = shared.close();
                        return;
                    }
                }
                EntryKind::Config => match ClusterConfig::decode(&entry.data) {
                    Ok(config) => {
                        log::info!(
                            "installing membership of {} nodes (cluster {})",
                            config.nodes.len(),
                            config.cluster_id
                        );
                        if let Some(dir) = &dir {
                            if let Err(e) = config.save(dir) {
                                log::warn!("could not persist membership: {}", e);
                            }
                        }
                        shared.lock().config = Some(config);
                    }
                    Err(e) => log::error!("bad config entry at {}: {}", next, e),
                },
                EntryKind::Nop => {}
            }
            shared.lock().applied_index = next;
            shared.applied_tx.send_replace(next);
            metrics::ENTRIES_APPLIED.inc();
        }
        tokio::select! {
            res = commit_rx.changed() => {
                if res.is_err() {
                    return;
                }
            }
            _ = drop_rx.changed() => {
                if *drop_rx.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::clock::StepRandom;
    use crate::raft::transport::MemoryTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// State machine that records every applied command.
    struct RecordingFsm {
        applied: Arc<Mutex<Vec<LogEntry>>>,
    }

    impl StateMachine for RecordingFsm {
        fn apply(&mut self, entry: &LogEntry) -> Result<()> {
            self.applied.lock().unwrap().push(entry.clone());
            Ok(())
        }

        fn snapshot(&self, _w: &mut dyn std::io::Write) -> Result<()> {
            Ok(())
        }

        fn restore(&mut self, _r: &mut dyn std::io::Read) -> Result<()> {
            Ok(())
        }
    }

    fn test_node(
        url: Option<&str>,
        transport: Arc<MemoryTransport>,
    ) -> (Node, Arc<Mutex<Vec<LogEntry>>>) {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let options = NodeOptions {
            url: url.map(String::from),
            ..NodeOptions::default()
        };
        let node = Node::with_defaults(
            options,
            RecordingFsm {
                applied: applied.clone(),
            },
            transport,
        );
        (node, applied)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    fn assert_index_invariant(node: &Node) {
        let applied = node.applied_index();
        let commit = node.commit_index();
        let current = node.current_index();
        assert!(
            applied <= commit && commit <= current,
            "applied {} <= commit {} <= current {} violated",
            applied,
            commit,
            current
        );
    }

    /// Provision a static two-node membership plus fixed ids, the way
    /// an operator would lay out the data directories.
    fn provision_pair(dir1: &Path, dir2: &Path) {
        for (dir, id) in [(dir1, 1u64), (dir2, 2u64)] {
            fs::create_dir_all(dir).unwrap();
            fs::write(dir.join(ID_FILE), id.to_string()).unwrap();
        }
        let config = ClusterConfig {
            cluster_id: 99,
            nodes: vec![
                Peer {
                    id: 1,
                    url: "mem://n1".into(),
                },
                Peer {
                    id: 2,
                    url: "mem://n2".into(),
                },
            ],
        };
        config.save(dir1).unwrap();
        config.save(dir2).unwrap();
    }

    #[tokio::test]
    async fn single_node_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let (node, applied) = test_node(Some("http://n1:8080"), transport);
        node.open(dir.path()).unwrap();

        node.initialize().await.unwrap();

        assert_eq!(node.state(), Role::Leader);
        assert_eq!(node.current_term(), 1);
        assert_eq!(node.current_index(), 1);
        assert_eq!(node.commit_index(), 1);
        assert_index_invariant(&node);

        let config = node.cluster_config().expect("membership installed");
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.nodes[0].url, "http://n1:8080");
        assert!(dir.path().join("config").exists());

        // The config entry never reaches the state machine.
        assert!(applied.lock().unwrap().is_empty());

        match node.initialize().await {
            Err(Error::AlreadyInitialized) => {}
            other => panic!("expected AlreadyInitialized, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn initialize_requires_url() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _) = test_node(None, MemoryTransport::new());
        node.open(dir.path()).unwrap();
        match node.initialize().await {
            Err(Error::UrlRequired) => {}
            other => panic!("expected UrlRequired, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn apply_rejected_on_non_leader() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _) = test_node(Some("http://n1:8080"), MemoryTransport::new());
        node.open(dir.path()).unwrap();

        match node.apply(b"x".to_vec()).await {
            Err(Error::NotLeader) => {}
            other => panic!("expected NotLeader, got {:?}", other),
        }
        assert_eq!(node.current_index(), 0);
    }

    #[tokio::test]
    async fn vote_denied_stale_term() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _) = test_node(None, MemoryTransport::new());
        node.open(dir.path()).unwrap();

        assert_eq!(node.request_vote(5, 99, 0, 0).unwrap(), 5);
        assert_eq!(node.current_term(), 5);

        match node.request_vote(4, 98, 0, 0) {
            Err(Error::StaleTerm) => {}
            other => panic!("expected StaleTerm, got {:?}", other),
        }
        assert_eq!(node.current_term(), 5);
    }

    #[tokio::test]
    async fn vote_denied_already_voted() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _) = test_node(None, MemoryTransport::new());
        node.open(dir.path()).unwrap();

        node.request_vote(2, 7, 0, 0).unwrap();
        match node.request_vote(2, 8, 0, 0) {
            Err(Error::AlreadyVoted) => {}
            other => panic!("expected AlreadyVoted, got {:?}", other),
        }
        // Re-granting the same candidate is fine.
        assert_eq!(node.request_vote(2, 7, 0, 0).unwrap(), 2);
    }

    #[tokio::test]
    async fn vote_denied_out_of_date_log() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _) = test_node(Some("http://n1:8080"), MemoryTransport::new());
        node.open(dir.path()).unwrap();
        node.initialize().await.unwrap();

        // Candidate's log is empty while ours holds (1, 1).
        match node.request_vote(4, 77, 0, 0) {
            Err(Error::OutOfDateLog) => {}
            other => panic!("expected OutOfDateLog, got {:?}", other),
        }
        // The higher term stuck and demoted us.
        assert_eq!(node.current_term(), 4);
        assert_eq!(node.state(), Role::Follower);

        // An equally complete log earns the vote.
        assert_eq!(node.request_vote(4, 77, 1, 1).unwrap(), 4);
    }

    #[tokio::test]
    async fn heartbeat_accepts_and_ignores_stale() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _) = test_node(None, MemoryTransport::new());
        node.open(dir.path()).unwrap();

        let (current_index, current_term) = node.heartbeat(3, 5, 42).unwrap();
        assert_eq!((current_index, current_term), (0, 3));
        assert_eq!(node.leader_id(), Some(42));
        // Commit never runs past what we hold locally.
        assert_eq!(node.commit_index(), 0);

        // A stale leader only learns our term.
        let (_, term) = node.heartbeat(2, 9, 43).unwrap();
        assert_eq!(term, 3);
        assert_eq!(node.leader_id(), Some(42));
    }

    #[tokio::test]
    async fn write_to_preconditions() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _) = test_node(Some("http://n1:8080"), MemoryTransport::new());
        node.open(dir.path()).unwrap();
        node.initialize().await.unwrap();

        let (_client, mut server) = tokio::io::duplex(1024);
        match node.write_to(&mut server, 1, 3).await {
            Err(Error::UncommittedIndex) => {}
            other => panic!("expected UncommittedIndex, got {:?}", other),
        }

        // A newer term demotes us on the spot.
        match node.write_to(&mut server, 5, 1).await {
            Err(Error::NotLeader) => {}
            other => panic!("expected NotLeader, got {:?}", other),
        }
        assert_eq!(node.state(), Role::Follower);
        assert_eq!(node.current_term(), 5);

        match node.write_to(&mut server, 5, 1).await {
            Err(Error::NotLeader) => {}
            other => panic!("expected NotLeader, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn streaming_tail_catches_up_then_follows() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _) = test_node(Some("http://n1:8080"), MemoryTransport::new());
        node.open(dir.path()).unwrap();
        node.initialize().await.unwrap();
        for i in 2..=5 {
            node.apply(format!("cmd-{}", i).into_bytes()).await.unwrap();
        }
        assert_eq!(node.commit_index(), 5);

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let shared = node.shared.clone();
        let streamer = tokio::spawn(async move {
            let mut server = server;
            shared.write_to(&mut server, 1, 3).await
        });

        // Entries 3..=5 arrive immediately, byte-exact.
        let mut expected = Vec::new();
        for i in 3..=5u64 {
            LogEntry::new(EntryKind::Command, i, 1, format!("cmd-{}", i).into_bytes())
                .encode_to(&mut expected);
        }
        let mut got = vec![0u8; expected.len()];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);

        // A fresh command flows down the same stream.
        node.apply(b"cmd-6".to_vec()).await.unwrap();
        let e6 = LogEntry::new(EntryKind::Command, 6, 1, b"cmd-6".to_vec());
        let mut got = vec![0u8; e6.encoded_len()];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(got, e6.encode());

        // Closing the node releases the tail writer cleanly.
        node.close().unwrap();
        streamer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn read_from_appends_and_reconciles_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _) = test_node(None, MemoryTransport::new());
        node.open(dir.path()).unwrap();

        let (mut tx, rx) = tokio::io::duplex(4096);
        let mut frames = Vec::new();
        LogEntry::new(EntryKind::Nop, 1, 1, Vec::new()).encode_to(&mut frames);
        LogEntry::new(EntryKind::Command, 2, 1, b"a".to_vec()).encode_to(&mut frames);
        tx.write_all(&frames).await.unwrap();
        drop(tx);
        node.read_from(rx).await.unwrap();
        assert_eq!(node.current_index(), 2);

        // A second stream overlapping with a conflicting term
        // truncates the uncommitted suffix first.
        let (mut tx, rx) = tokio::io::duplex(4096);
        let mut frames = Vec::new();
        LogEntry::new(EntryKind::Command, 2, 2, b"b".to_vec()).encode_to(&mut frames);
        LogEntry::new(EntryKind::Command, 3, 2, b"c".to_vec()).encode_to(&mut frames);
        tx.write_all(&frames).await.unwrap();
        drop(tx);
        node.read_from(rx).await.unwrap();
        assert_eq!(node.current_index(), 3);
        assert_index_invariant(&node);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_promotes_follower_after_timeout_and_jitter() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(dir.path().join(ID_FILE), "1").unwrap();
        let config = ClusterConfig {
            cluster_id: 7,
            nodes: vec![
                Peer {
                    id: 1,
                    url: "mem://n1".into(),
                },
                Peer {
                    id: 2,
                    url: "mem://n2".into(),
                },
            ],
        };
        config.save(dir.path()).unwrap();

        // Scripted jitter: every election timer is the 150 ms base
        // timeout plus exactly 40 ms.
        let node = Node::new(
            NodeOptions::default(),
            RecordingFsm {
                applied: Arc::new(Mutex::new(Vec::new())),
            },
            MemoryTransport::new(),
            Arc::new(SystemClock),
            Arc::new(StepRandom::new(vec![40])),
        );
        node.open(dir.path()).unwrap();
        assert_eq!(node.state(), Role::Follower);

        // 180 ms in: past the base timeout but still inside the
        // jitter window, so the ticker must not have fired yet.
        for _ in 0..18 {
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(node.state(), Role::Follower);
        assert_eq!(node.current_term(), 0);

        // Crossing 190 ms fires the election. The lone peer is
        // unreachable, so the node campaigns and stays a candidate.
        for _ in 0..3 {
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(node.state(), Role::Candidate);
        assert_eq!(node.current_term(), 1);
        assert_eq!(node.leader_id(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn elect_wins_with_peer_vote() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        provision_pair(dir1.path(), dir2.path());

        let transport = MemoryTransport::new();
        let (n1, _) = test_node(Some("mem://n1"), transport.clone());
        let (n2, _) = test_node(Some("mem://n2"), transport.clone());
        n1.open(dir1.path()).unwrap();
        n2.open(dir2.path()).unwrap();
        transport.register("mem://n1", n1.rpc_handler());
        transport.register("mem://n2", n2.rpc_handler());

        n1.elect().await.unwrap();

        assert_eq!(n1.state(), Role::Leader);
        assert_eq!(n1.current_term(), 1);
        // The freshly elected leader stamps its term with a no-op.
        assert_eq!(n1.current_index(), 1);
        assert_eq!(n2.current_term(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn two_node_replication_end_to_end() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        provision_pair(dir1.path(), dir2.path());

        let transport = MemoryTransport::new();
        let (n1, applied1) = test_node(Some("mem://n1"), transport.clone());
        let (n2, applied2) = test_node(Some("mem://n2"), transport.clone());
        n1.open(dir1.path()).unwrap();
        n2.open(dir2.path()).unwrap();
        transport.register("mem://n1", n1.rpc_handler());
        transport.register("mem://n2", n2.rpc_handler());

        n1.elect().await.unwrap();
        assert_eq!(n1.state(), Role::Leader);

        // Heartbeats propagate leadership; the follower pulls the
        // stream and acks drive the commit index forward.
        n1.apply(b"SET x 1".to_vec()).await.unwrap();
        wait_until(|| n2.applied_index() >= 2).await;

        assert_eq!(n2.leader_id(), Some(1));
        assert_eq!(n2.current_index(), 2);
        assert_index_invariant(&n1);
        assert_index_invariant(&n2);

        // Log-matching: the committed command is identical on both.
        let on1 = applied1.lock().unwrap().clone();
        let on2 = applied2.lock().unwrap().clone();
        assert_eq!(on1.len(), 1);
        assert_eq!(on1[0].data, b"SET x 1");
        assert_eq!(on1[0].index, on2[0].index);
        assert_eq!(on1[0].term, on2[0].term);
        assert_eq!(on1[0].data, on2[0].data);

        // A second command rides the already-open stream.
        n1.apply(b"SET y 2".to_vec()).await.unwrap();
        wait_until(|| n2.applied_index() >= 3).await;
        assert_eq!(applied2.lock().unwrap().last().unwrap().data, b"SET y 2");
    }

    #[tokio::test]
    async fn restart_recovers_identity_and_entries() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let id;
        {
            let (node, _) = test_node(Some("http://n1:8080"), transport.clone());
            node.open(dir.path()).unwrap();
            node.initialize().await.unwrap();
            node.apply(b"SET a 1".to_vec()).await.unwrap();
            node.apply(b"SET b 2".to_vec()).await.unwrap();
            id = node.id();
            node.close().unwrap();
        }

        let (node, applied) = test_node(Some("http://n1:8080"), transport);
        node.open(dir.path()).unwrap();
        assert_eq!(node.id(), id);
        assert_eq!(node.current_index(), 3);
        assert_eq!(node.current_term(), 1);
        assert_eq!(node.state(), Role::Follower);
        assert!(node.cluster_config().is_some());

        // Re-electing the single member replays the log into the
        // fresh state machine.
        node.elect().await.unwrap();
        assert_eq!(node.state(), Role::Leader);
        assert_eq!(node.current_term(), 2);
        wait_until(|| node.applied_index() == node.current_index()).await;
        let commands = applied.lock().unwrap().clone();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].data, b"SET a 1");
        assert_eq!(commands[1].data, b"SET b 2");
    }

    #[tokio::test]
    async fn second_opener_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (a, _) = test_node(None, MemoryTransport::new());
        let (b, _) = test_node(None, MemoryTransport::new());

        a.open(dir.path()).unwrap();
        match b.open(dir.path()) {
            Err(Error::AlreadyOpen) => {}
            other => panic!("expected AlreadyOpen, got {:?}", other),
        }

        a.close().unwrap();
        b.open(dir.path()).unwrap();
        assert!(b.opened());
        assert!(!a.opened());
    }

    #[tokio::test]
    async fn closed_node_rejects_rpcs() {
        let (node, _) = test_node(None, MemoryTransport::new());
        assert!(matches!(node.heartbeat(1, 0, 1), Err(Error::Closed)));
        assert!(matches!(node.request_vote(1, 1, 0, 0), Err(Error::Closed)));
        assert!(matches!(node.apply(b"x".to_vec()).await, Err(Error::Closed)));
        assert!(node.path().is_none());
        assert!(!node.opened());
    }
}
