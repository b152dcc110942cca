//! Cluster membership and its on-disk document.
//!
//! The membership is replicated through the log itself as a Config
//! entry; the same JSON document is kept in the data directory so a
//! restarting node knows its peers before it hears from anyone.

use std::fs;
use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use super::error::Result;

const CONFIG_FILE: &str = "config";

/// One member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: u64,
    pub url: String,
}

/// Cluster membership. `cluster_id` keeps two clusters that share a
/// network from accepting each other's traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_id: u64,
    pub nodes: Vec<Peer>,
}

impl ClusterConfig {
    /// A one-member bootstrap membership.
    pub fn bootstrap(cluster_id: u64, id: u64, url: String) -> ClusterConfig {
        ClusterConfig {
            cluster_id,
            nodes: vec![Peer { id, url }],
        }
    }

    /// Members other than `id`.
    pub fn peers_of(&self, id: u64) -> Vec<Peer> {
        self.nodes.iter().filter(|n| n.id != id).cloned().collect()
    }

    /// Strict majority of the membership.
    pub fn quorum(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<ClusterConfig> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Load the membership document from `dir`, or `None` when the
    /// node has never been initialized.
    pub fn load(dir: &Path) -> Result<Option<ClusterConfig>> {
        let path = dir.join(CONFIG_FILE);
        match fs::read(&path) {
            Ok(data) => Ok(Some(ClusterConfig::decode(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the membership document into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(dir.join(CONFIG_FILE), data)?;
        Ok(())
    }
}
