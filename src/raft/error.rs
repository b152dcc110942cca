//! Error types surfaced by the replicated log.

use thiserror::Error;

/// Result alias used throughout the raft module.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the log core distinguishes for its callers.
#[derive(Debug, Error)]
pub enum Error {
    /// The log is already open, or its data directory is held by
    /// another opener.
    #[error("log already open")]
    AlreadyOpen,

    /// Operation attempted against a closed log.
    #[error("log closed")]
    Closed,

    /// `initialize` called after entries were already written.
    #[error("log already initialized")]
    AlreadyInitialized,

    /// `initialize` called without an advertised URL.
    #[error("url required")]
    UrlRequired,

    /// Write attempted at a node that is not the leader.
    #[error("not leader")]
    NotLeader,

    /// Vote denied: candidate's term is behind ours.
    #[error("stale term")]
    StaleTerm,

    /// Vote denied: already voted for another candidate this term.
    #[error("already voted")]
    AlreadyVoted,

    /// Vote denied: candidate's log is less up-to-date than ours.
    #[error("out of date log")]
    OutOfDateLog,

    /// Stream requested past the commit frontier.
    #[error("uncommitted index")]
    UncommittedIndex,

    /// Mutation attempted on a sealed segment.
    #[error("segment sealed")]
    Sealed,

    /// Index falls outside the segment's range.
    #[error("index out of range")]
    OutOfRange,

    /// Record ended before its header or payload was complete.
    #[error("truncated log entry")]
    Truncated,

    /// Record payload length exceeds the configured maximum.
    #[error("log entry data too large")]
    Oversize,

    /// Record header carries an unassigned kind nibble (0xF is the
    /// reserved snapshot marker).
    #[error("invalid log entry kind: {0:#x}")]
    InvalidEntryKind(u8),

    /// A tail writer fell behind the append fan-out and was dropped.
    #[error("stream lagged behind the log tail")]
    StreamLagged,

    /// The state machine rejected a committed entry. Fatal: the node
    /// shuts down, since retrying would break determinism.
    #[error("state machine failed: {0}")]
    StateMachine(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("config document: {0}")]
    Config(#[from] serde_json::Error),
}

impl Error {
    /// Wrap a state machine failure.
    pub fn state_machine<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::StateMachine(Box::new(err))
    }
}
