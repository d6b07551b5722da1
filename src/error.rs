use thiserror::Error;

/// Error raised by the mesh core. Every failure here is fatal for the
/// process group: callers are expected to tear down all ranks rather than
/// attempt partial recovery.
#[derive(Debug, Error)]
pub enum RillError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("mesh topology error: {0}")]
    Topology(String),

    #[error("restart file broken: {0}")]
    RestartBroken(String),

    #[error("tree reconstruction failed: stored {stored} blocks, rebuilt {rebuilt}")]
    TreeReconstruction { stored: usize, rebuilt: usize },

    #[error("load balancing failed: {0}")]
    LoadBalance(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RillError>;
