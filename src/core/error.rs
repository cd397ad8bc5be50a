//! Error types for the mapping engine

use thiserror::Error;

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Allocation error: {0}")]
    Allocation(String),

    #[error("Voxel coordinate ({0}, {1}, {2}) outside the octree volume")]
    Boundary(i32, i32, i32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
