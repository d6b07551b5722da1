//! Adaptive mesh and block-management core of a distributed
//! block-structured finite-volume engine for hyperbolic conservation laws.
//!
//! The crate partitions a rectangular domain into fixed-size logical blocks
//! organized as a 2:1-balanced forest, distributes them over SPMD ranks,
//! derives per-block neighbor tables across refinement levels, and, when
//! the refinement criterion votes for change, restructures the forest,
//! rebalances, and migrates block data with conservative restriction and
//! prolongation. Solvers plug in through [`state::BlockState`]; transports
//! plug in through [`comm::Communicator`].

pub mod comm;
pub mod config;
pub mod error;
pub mod geometry;
pub mod mesh;
pub mod state;

/// Common types used by most applications built on this crate.
pub mod prelude {
    pub use crate::comm::{Communicator, SoloComm, ThreadComm};
    pub use crate::config::{BoundaryKind, MeshConfig, RefinementMode};
    pub use crate::error::{Result, RillError};
    pub use crate::geometry::{BlockTree, LogicalLocation, RegionSize};
    pub use crate::mesh::{Block, BoundaryExchange, Mesh, NeighborBlock, NeighborKind, RefineFlag};
    pub use crate::state::{BlockState, HydroConfig, HydroState, StateFactory, TransferKind};
}
