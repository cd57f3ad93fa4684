use intentmesh_types::AllocationStatus;
use resource_allocator::AllocationError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Configuration Error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("Allocator Error: {0}")]
    Allocator(#[from] AllocationError),

    #[error("Serialization Error: {0}")]
    Serialize(String),

    #[error("Allocation {allocation_id} ended as {status}")]
    AllocationFailed {
        allocation_id: String,
        status: AllocationStatus,
    },

    #[error("Infeasible plan: {0} step(s) cannot run on the registry")]
    Infeasible(usize),
}

pub type CliResult<T = ()> = Result<T, CliError>;
