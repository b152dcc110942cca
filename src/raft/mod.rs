//! Replicated log engine: a durable command log ordered by raft
//! consensus and applied, in index order, to a user-supplied state
//! machine.

pub mod cluster;
pub mod clock;
pub mod entry;
pub mod error;
pub mod node;
pub mod segment;
pub mod transport;

pub use cluster::{ClusterConfig, Peer};
pub use clock::{Clock, OsRandom, RandomSource, SystemClock};
pub use entry::{EntryKind, LogEntry};
pub use error::{Error, Result};
pub use node::{Node, NodeOptions};
pub use segment::{Segment, SegmentStore};
pub use transport::{MemoryTransport, RaftRpc, Transport};

/// Whether the node is following, campaigning, or leading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Passive state: accepts entries and votes when asked.
    Follower,
    /// Transitional state: requesting votes to become leader.
    Candidate,
    /// Active state: orders appends, replicates, advances commits.
    Leader,
}

impl Default for Role {
    fn default() -> Self {
        Role::Follower
    }
}

/// Deterministic state machine the committed log is applied to.
///
/// Called only from the node's single applier task, strictly in index
/// order; an `apply` failure is fatal to the node.
pub trait StateMachine: Send + 'static {
    /// Apply one committed command entry.
    fn apply(&mut self, entry: &LogEntry) -> Result<()>;

    /// Write a point-in-time snapshot of the state.
    fn snapshot(&self, w: &mut dyn std::io::Write) -> Result<()>;

    /// Replace the state from a snapshot.
    fn restore(&mut self, r: &mut dyn std::io::Read) -> Result<()>;
}
