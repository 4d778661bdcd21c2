use crate::crypto::hash::Hash256;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TopologyError>;

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Topology corrupt: {0}")]
    TopologyCorrupt(String),

    #[error("Transaction not found: {0}")]
    TxNotFound(Hash256),

    #[error("Block out of order: expected height {expected}, got {got}")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("Block {hash} does not extend tip {tip}")]
    NotExtendingTip { hash: Hash256, tip: Hash256 },

    #[error("Topology not configured")]
    NotConfigured,

    #[error("Topology service stopped")]
    ServiceStopped,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TopologyError {
    /// Errors that leave the topology unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TopologyError::TopologyCorrupt(_))
    }
}

impl From<bitcoincore_rpc::Error> for TopologyError {
    fn from(err: bitcoincore_rpc::Error) -> Self {
        TopologyError::Backend(format!("bitcoind RPC error: {}", err))
    }
}

impl From<tokio::task::JoinError> for TopologyError {
    fn from(err: tokio::task::JoinError) -> Self {
        TopologyError::Backend(format!("backend task failed: {}", err))
    }
}
