//! Cluster layout queries the launcher depends on

use runtime_core::{Error, Rank, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Capability interface for sizing and interpreting the worker pool
pub trait Strategy: Send + Sync {
    /// Worker processes to start on this node
    fn num_processes(&self) -> usize;

    /// Number of participating nodes
    fn num_nodes(&self) -> usize {
        1
    }

    /// Rank of this node
    fn node_rank(&self) -> Rank;

    /// Total number of processes across all nodes
    fn world_size(&self) -> usize {
        self.num_nodes() * self.num_processes()
    }

    /// Global rank of the process with `local_rank` on this node
    fn global_rank(&self, local_rank: Rank) -> Rank {
        self.node_rank() * self.num_processes() + local_rank
    }

    /// Address of the rank-zero process used for rendezvous
    fn main_address(&self) -> String;

    /// Port of the rank-zero process used for rendezvous
    fn main_port(&self) -> u16;
}

/// Rendezvous and layout settings of a cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterEnvironment {
    pub main_address: String,
    pub main_port: u16,
    pub node_rank: Rank,
    pub num_nodes: usize,
}

impl ClusterEnvironment {
    /// Single node on localhost with a free port
    pub fn local() -> Result<Self> {
        Ok(Self {
            main_address: "127.0.0.1".to_string(),
            main_port: pick_port()?,
            node_rank: 0,
            num_nodes: 1,
        })
    }

    /// Read `MASTER_ADDR`, `MASTER_PORT`, `NODE_RANK` and `NUM_NODES`,
    /// defaulting to a single local node with a free port
    pub fn from_env() -> Result<Self> {
        let main_address =
            std::env::var("MASTER_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
        let main_port = match std::env::var("MASTER_PORT") {
            Ok(raw) => parse_var("MASTER_PORT", &raw)?,
            Err(_) => pick_port()?,
        };
        let node_rank = match std::env::var("NODE_RANK") {
            Ok(raw) => parse_var("NODE_RANK", &raw)?,
            Err(_) => 0,
        };
        let num_nodes = match std::env::var("NUM_NODES") {
            Ok(raw) => parse_var("NUM_NODES", &raw)?,
            Err(_) => 1,
        };

        if node_rank >= num_nodes {
            return Err(Error::InvalidConfig {
                message: format!("NODE_RANK {} out of range for {} nodes", node_rank, num_nodes),
            });
        }

        let env = Self {
            main_address,
            main_port,
            node_rank,
            num_nodes,
        };
        debug!(?env, "Resolved cluster environment");
        Ok(env)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| Error::InvalidConfig {
        message: format!("{} has invalid value '{}'", name, raw),
    })
}

fn pick_port() -> Result<u16> {
    portpicker::pick_unused_port().ok_or_else(|| Error::InvalidConfig {
        message: "No free port available for MASTER_PORT".to_string(),
    })
}

/// Data-parallel strategy that starts one process per device on each node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdpSpawnStrategy {
    cluster: ClusterEnvironment,
    num_processes: usize,
}

impl DdpSpawnStrategy {
    pub fn new(cluster: ClusterEnvironment, num_processes: usize) -> Result<Self> {
        if num_processes == 0 {
            return Err(Error::InvalidConfig {
                message: "num_processes must be at least 1".to_string(),
            });
        }
        Ok(Self {
            cluster,
            num_processes,
        })
    }

    pub fn cluster(&self) -> &ClusterEnvironment {
        &self.cluster
    }
}

impl Strategy for DdpSpawnStrategy {
    fn num_processes(&self) -> usize {
        self.num_processes
    }

    fn num_nodes(&self) -> usize {
        self.cluster.num_nodes
    }

    fn node_rank(&self) -> Rank {
        self.cluster.node_rank
    }

    fn main_address(&self) -> String {
        self.cluster.main_address.clone()
    }

    fn main_port(&self) -> u16 {
        self.cluster.main_port
    }
}
