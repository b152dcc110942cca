//! raftlog: a replicated log engine.
//!
//! A cluster of nodes agrees on an ordered sequence of opaque commands
//! through raft consensus, persists them in an append-only segment,
//! and applies them exactly once, in index order, to a user-supplied
//! [`raft::StateMachine`]. A leader streams log bytes to followers and
//! keeps forwarding fresh appends on the same stream.

pub mod config;
pub mod metrics;
pub mod raft;
pub mod state_kv;

pub use raft::{
    ClusterConfig, EntryKind, Error, LogEntry, MemoryTransport, Node, NodeOptions, Peer, Result,
    Role, StateMachine,
};
