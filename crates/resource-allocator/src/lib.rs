#![deny(unsafe_code)]
//! Resource allocator - binds execution plans to device, edge and cloud resources
//!
//! This crate provides the allocation pipeline for intentmesh plans:
//! - Feasibility scanning of registry resources per step
//! - Privacy- and cost-aware placement across local, edge and cloud targets
//! - Conflict-free reservation binding with fallbacks
//! - Execution preparation, asynchronous dispatch and adaptive rebinding

pub mod allocator;
pub mod binder;
pub mod dispatcher;
pub mod error;
pub mod estimator;
pub mod feasibility;
pub mod metrics;
pub mod placement;
pub mod prepper;
pub mod rebinder;
pub mod registry;
pub mod reservation_store;
pub mod snapshot;
pub mod store;
pub mod telemetry;

// Re-export the main entry points
pub use allocator::{AllocatorBuilder, MaintenanceHandle, ResourceAllocator};
pub use binder::ResourceBinder;
pub use dispatcher::{Dispatcher, ExecutionBackend, ExecutorError, LoggingExecutor};
pub use error::{AllocationError, AllocationResult, Phase};
pub use estimator::{BaselineEstimator, CostEstimate, CostEstimator, JitterEstimator};
pub use feasibility::FeasibilityScanner;
pub use metrics::compute_metrics;
pub use placement::PlacementDecider;
pub use prepper::ExecutionPrepper;
pub use rebinder::AdaptiveRebinder;
pub use registry::{InMemoryResourceRegistry, RegistryError, ResourceRegistry};
pub use reservation_store::{InMemoryReservationStore, ReservationError, ReservationStore};
pub use snapshot::{AllocatorSnapshot, RestoreReport};
pub use store::{AllocationRecord, AllocationStore, InMemoryAllocationStore};
pub use telemetry::AllocatorTelemetry;
