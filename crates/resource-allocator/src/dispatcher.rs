use crate::reservation_store::ReservationStore;
use crate::store::AllocationStore;
use crate::telemetry::AllocatorTelemetry;
use async_trait::async_trait;
use intentmesh_config::DispatchConfig;
use intentmesh_types::{AllocationStatus, ResourceAllocation};
use log::{error, info, warn};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Errors reported by an execution backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutorError {
    #[error("executor rejected allocation: {0}")]
    Rejected(String),

    #[error("executor unavailable: {0}")]
    Unavailable(String),
}

/// Downstream executor that receives reserved allocations
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Hand over an allocation; returns an execution handle
    async fn submit(&self, allocation: &ResourceAllocation) -> Result<String, ExecutorError>;
}

/// Backend that only logs what it would execute
#[derive(Debug, Clone, Default)]
pub struct LoggingExecutor;

#[async_trait]
impl ExecutionBackend for LoggingExecutor {
    fn name(&self) -> &str {
        "logging"
    }

    async fn submit(&self, allocation: &ResourceAllocation) -> Result<String, ExecutorError> {
        let handle = format!("exec-{}", Uuid::new_v4());
        info!(
            "Executing allocation {} ({} steps) as {}",
            allocation.allocation_id,
            allocation.bound_steps.len(),
            handle
        );
        for bound in &allocation.bound_steps {
            info!(
                "  step {} on {} ({})",
                bound.step_id(),
                bound.resource_id(),
                bound.placement.target
            );
        }
        Ok(handle)
    }
}

/// Hands reserved allocations to the execution backend
pub struct Dispatcher {
    backend: Arc<dyn ExecutionBackend>,
    store: Arc<dyn AllocationStore>,
    reservations: Arc<dyn ReservationStore>,
    config: DispatchConfig,
    telemetry: AllocatorTelemetry,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        store: Arc<dyn AllocationStore>,
        reservations: Arc<dyn ReservationStore>,
        config: DispatchConfig,
        telemetry: AllocatorTelemetry,
    ) -> Self {
        Self {
            backend,
            store,
            reservations,
            config,
            telemetry,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Submit an allocation and record the outcome.
    ///
    /// Returns the final status; failures are recorded on the allocation
    /// rather than returned.
    pub async fn dispatch_allocation(&self, allocation: ResourceAllocation) -> AllocationStatus {
        let allocation_id = allocation.allocation_id.clone();

        match self.backend.submit(&allocation).await {
            Ok(handle) => {
                if let Err(e) = self
                    .store
                    .transition(&allocation_id, AllocationStatus::Dispatched, None)
                    .await
                {
                    // cancelled or rebinding while the executor was busy
                    warn!(
                        "Allocation {} was not marked dispatched: {}",
                        allocation_id, e
                    );
                    self.telemetry.record_dispatch("superseded");
                    return self.current_status(&allocation_id).await;
                }

                if let Err(e) = self
                    .store
                    .set_execution_handle(&allocation_id, handle.clone())
                    .await
                {
                    warn!("Failed to store execution handle for {}: {}", allocation_id, e);
                }
                if let Err(e) = self
                    .reservations
                    .mark_consumed(&allocation.reservation_ids())
                    .await
                {
                    warn!("Failed to mark reservations of {} consumed: {}", allocation_id, e);
                }

                info!(
                    "Dispatched allocation {} to {} as {}",
                    allocation_id,
                    self.backend.name(),
                    handle
                );
                self.telemetry.record_dispatch("dispatched");
                AllocationStatus::Dispatched
            }
            Err(e) => {
                error!("Dispatch of allocation {} failed: {}", allocation_id, e);
                self.telemetry.record_dispatch("failed");

                if let Err(te) = self
                    .store
                    .transition(
                        &allocation_id,
                        AllocationStatus::Failed,
                        Some(format!("dispatch failed: {}", e)),
                    )
                    .await
                {
                    warn!("Could not mark allocation {} failed: {}", allocation_id, te);
                    return self.current_status(&allocation_id).await;
                }

                if self.config.release_on_failure {
                    match self.reservations.release_allocation(&allocation_id).await {
                        Ok(released) => info!(
                            "Released {} reservation(s) of failed allocation {}",
                            released.len(),
                            allocation_id
                        ),
                        Err(re) => warn!(
                            "Failed to release reservations of {}: {}",
                            allocation_id, re
                        ),
                    }
                }
                AllocationStatus::Failed
            }
        }
    }

    async fn current_status(&self, allocation_id: &str) -> AllocationStatus {
        match self.store.get(allocation_id).await {
            Ok(Some(record)) => record.status(),
            _ => AllocationStatus::Failed,
        }
    }
}
