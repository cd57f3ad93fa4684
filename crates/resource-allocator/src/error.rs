use crate::dispatcher::ExecutorError;
use crate::registry::RegistryError;
use crate::reservation_store::ReservationError;
use intentmesh_types::AllocationStatus;
use std::fmt;
use thiserror::Error;

/// Allocation phase, used to label timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Feasibility,
    Placement,
    Binding,
    Rebinding,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Feasibility => "feasibility",
            Phase::Placement => "placement",
            Phase::Binding => "binding",
            Phase::Rebinding => "rebinding",
        };
        f.write_str(name)
    }
}

/// Errors raised inside the allocation pipeline
#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("step {step_id} is infeasible: {reason}")]
    Infeasible { step_id: String, reason: String },

    #[error("no reservation could be taken for step {step_id}: {reason}")]
    Conflict { step_id: String, reason: String },

    #[error("{phase} phase timed out after {timeout_ms}ms for step {step_id}")]
    Timeout {
        phase: Phase,
        step_id: String,
        timeout_ms: u64,
    },

    #[error("dispatch failed: {0}")]
    Dispatch(#[from] ExecutorError),

    #[error("rebinding exhausted for step {step_id} after {attempts} attempts")]
    RebindExhausted { step_id: String, attempts: u32 },

    #[error("allocation {0} not found")]
    NotFound(String),

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: AllocationStatus,
        to: AllocationStatus,
    },

    #[error("allocation {0} was cancelled")]
    Cancelled(String),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("reservation error: {0}")]
    Reservation(#[from] ReservationError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AllocationError {
    pub fn infeasible(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        AllocationError::Infeasible {
            step_id: step_id.into(),
            reason: reason.into(),
        }
    }
}

pub type AllocationResult<T> = Result<T, AllocationError>;
