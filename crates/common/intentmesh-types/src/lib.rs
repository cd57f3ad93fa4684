#![deny(unsafe_code)]
//! Shared data model for the intentmesh resource allocator.
//!
//! These records describe resources, execution plans and every artifact the
//! allocator produces along the way: feasibility results, placement decisions,
//! reservations, bound steps and the allocation aggregate itself. All of them
//! serialize with serde so allocation state can be snapshotted and reloaded.

pub mod allocation;
pub mod binding;
pub mod capability;
pub mod feasibility;
pub mod metrics;
pub mod placement;
pub mod plan;
pub mod reservation;

pub use allocation::{
    AllocationRequest, AllocationResponse, AllocationStatus, EnergyConstraints,
    PrivacyRequirements, RebindReason, RebindingRequest, ResourceAllocation,
};
pub use binding::{BoundStep, MinimizationRule, RedactionAction, RetryPolicy, RunConfiguration};
pub use capability::{PowerState, Protocol, ResourceCapability, ResourceType, MAINS_POWERED};
pub use feasibility::{FeasibilityResult, FeasibilityStatus};
pub use metrics::AllocationMetrics;
pub use placement::{PlacementDecision, PlacementStrategy, PlacementTarget};
pub use plan::{ExecutionPlan, ExecutionStep, PrivacyClass, StepType};
pub use reservation::ResourceReservation;
