//! RPC contract between replicas.
//!
//! The wire itself is an external collaborator; the replica only needs
//! the three outbound calls below, with ordering per peer and none
//! across peers. `MemoryTransport` routes the same calls between nodes
//! of one process for tests, demos and embedders.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::error::Result;

/// Arguments of a RequestVote call.
#[derive(Debug, Clone)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone)]
pub struct VoteResponse {
    pub term: u64,
    pub granted: bool,
}

/// Arguments of a Heartbeat call.
#[derive(Debug, Clone)]
pub struct HeartbeatRequest {
    pub term: u64,
    pub commit_index: u64,
    pub leader_id: u64,
}

/// A heartbeat ack doubles as the replication acknowledgement: the
/// responder reports the highest entry it has written.
#[derive(Debug, Clone)]
pub struct HeartbeatResponse {
    pub current_index: u64,
    pub current_term: u64,
}

/// Outbound operations the replica issues against its peers.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(&self, url: &str, req: VoteRequest) -> Result<VoteResponse>;

    async fn heartbeat(&self, url: &str, req: HeartbeatRequest) -> Result<HeartbeatResponse>;

    /// Open an entry stream from the peer starting at `from_index`.
    /// The returned reader yields encoded entries until the remote
    /// seals, closes, or drops the connection.
    async fn stream(
        &self,
        url: &str,
        term: u64,
        from_index: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>>;
}

/// Inbound face of a replica, as the transport sees it.
#[async_trait]
pub trait RaftRpc: Send + Sync {
    async fn vote(&self, req: VoteRequest) -> VoteResponse;

    async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse>;

    /// Serve an entry stream into `writer`; blocks for the life of the
    /// stream.
    async fn stream_to(
        &self,
        term: u64,
        from_index: u64,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Result<()>;
}

/// In-process transport: a registry of node handlers keyed by URL.
/// Streams run over `tokio::io::duplex` pipes.
#[derive(Default)]
pub struct MemoryTransport {
    handlers: Mutex<HashMap<String, Arc<dyn RaftRpc>>>,
}

impl MemoryTransport {
    pub fn new() -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport::default())
    }

    /// Make `handler` reachable at `url`.
    pub fn register(&self, url: impl Into<String>, handler: Arc<dyn RaftRpc>) {
        self.handlers
            .lock()
            .unwrap()
            .insert(url.into(), handler);
    }

    pub fn deregister(&self, url: &str) {
        self.handlers.lock().unwrap().remove(url);
    }

    fn lookup(&self, url: &str) -> Result<Arc<dyn RaftRpc>> {
        self.handlers
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, format!("no peer at {}", url)).into()
            })
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn request_vote(&self, url: &str, req: VoteRequest) -> Result<VoteResponse> {
        let handler = self.lookup(url)?;
        Ok(handler.vote(req).await)
    }

    async fn heartbeat(&self, url: &str, req: HeartbeatRequest) -> Result<HeartbeatResponse> {
        let handler = self.lookup(url)?;
        handler.heartbeat(req).await
    }

    async fn stream(
        &self,
        url: &str,
        term: u64,
        from_index: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let handler = self.lookup(url)?;
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            if let Err(e) = handler.stream_to(term, from_index, Box::new(server)).await {
                log::debug!("entry stream ended: {}", e);
            }
        });
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::error::Error;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct EchoRpc;

    #[async_trait]
    impl RaftRpc for EchoRpc {
        async fn vote(&self, req: VoteRequest) -> VoteResponse {
            VoteResponse {
                term: req.term,
                granted: true,
            }
        }

        async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse> {
            Ok(HeartbeatResponse {
                current_index: req.commit_index,
                current_term: req.term,
            })
        }

        async fn stream_to(
            &self,
            _term: u64,
            from_index: u64,
            mut writer: Box<dyn AsyncWrite + Send + Unpin>,
        ) -> Result<()> {
            writer.write_all(&from_index.to_be_bytes()).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn routes_to_registered_handler() {
        let transport = MemoryTransport::new();
        transport.register("http://n1:8080", Arc::new(EchoRpc));

        let resp = transport
            .request_vote(
                "http://n1:8080",
                VoteRequest {
                    term: 3,
                    candidate_id: 1,
                    last_log_index: 0,
                    last_log_term: 0,
                },
            )
            .await
            .unwrap();
        assert!(resp.granted);
        assert_eq!(resp.term, 3);

        let mut stream = transport.stream("http://n1:8080", 3, 7).await.unwrap();
        let mut buf = [0u8; 8];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(u64::from_be_bytes(buf), 7);
    }

    #[tokio::test]
    async fn unknown_peer_is_an_error() {
        let transport = MemoryTransport::new();
        let err = transport
            .heartbeat(
                "http://nowhere:1",
                HeartbeatRequest {
                    term: 1,
                    commit_index: 0,
                    leader_id: 1,
                },
            )
            .await;
        assert!(matches!(err, Err(Error::Io(_))));
    }
}
