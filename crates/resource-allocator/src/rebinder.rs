use crate::binder::ResourceBinder;
use crate::error::{AllocationError, AllocationResult, Phase};
use crate::feasibility::FeasibilityScanner;
use crate::placement::PlacementDecider;
use crate::prepper::ExecutionPrepper;
use intentmesh_config::RebindingConfig;
use intentmesh_types::{
    AllocationRequest, BoundStep, RebindingRequest, ResourceAllocation,
};
use log::{info, warn};
use std::collections::HashSet;
use std::sync::Arc;

/// Moves one bound step onto a different resource
pub struct AdaptiveRebinder {
    scanner: Arc<FeasibilityScanner>,
    decider: Arc<PlacementDecider>,
    binder: Arc<ResourceBinder>,
    prepper: ExecutionPrepper,
    config: RebindingConfig,
}

impl AdaptiveRebinder {
    pub fn new(
        scanner: Arc<FeasibilityScanner>,
        decider: Arc<PlacementDecider>,
        binder: Arc<ResourceBinder>,
        config: RebindingConfig,
    ) -> Self {
        Self {
            scanner,
            decider,
            binder,
            prepper: ExecutionPrepper::new(),
            config,
        }
    }

    pub fn config(&self) -> &RebindingConfig {
        &self.config
    }

    /// Re-run feasibility, placement and binding for one step, excluding its current resource.
    ///
    /// Returns a new allocation with that step replaced; the old reservation is
    /// still held and is the caller's to release. Nothing is left reserved on error.
    pub async fn rebind_step(
        &self,
        request: &RebindingRequest,
        allocation: &ResourceAllocation,
        alloc_request: &AllocationRequest,
    ) -> AllocationResult<ResourceAllocation> {
        let current = allocation
            .bound_step(&request.step_id)
            .ok_or_else(|| {
                AllocationError::NotFound(format!(
                    "step {} in allocation {}",
                    request.step_id, allocation.allocation_id
                ))
            })?
            .clone();

        let attempts = allocation.rebind_attempts_for(&request.step_id);
        if attempts >= self.config.max_attempts {
            return Err(AllocationError::RebindExhausted {
                step_id: request.step_id.clone(),
                attempts,
            });
        }

        info!(
            "Rebinding step {} of allocation {} away from {} ({})",
            request.step_id, allocation.allocation_id, request.current_resource_id, request.reason
        );

        let timeout = self.config.timeout();
        let attempt = self.rebind_inner(request, &current, alloc_request, allocation);
        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(bound)) => allocation.with_rebound_step(bound).ok_or_else(|| {
                AllocationError::Internal(format!(
                    "step {} vanished from allocation {}",
                    request.step_id, allocation.allocation_id
                ))
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    "Rebinding step {} of allocation {} timed out",
                    request.step_id, allocation.allocation_id
                );
                let keep: HashSet<String> = allocation.reservation_ids().into_iter().collect();
                self.binder
                    .release_orphans(&allocation.allocation_id, &keep)
                    .await?;
                Err(AllocationError::Timeout {
                    phase: Phase::Rebinding,
                    step_id: request.step_id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn rebind_inner(
        &self,
        request: &RebindingRequest,
        current: &BoundStep,
        alloc_request: &AllocationRequest,
        allocation: &ResourceAllocation,
    ) -> AllocationResult<BoundStep> {
        let mut excluded = HashSet::new();
        excluded.insert(request.current_resource_id.clone());
        excluded.insert(current.resource_id().to_string());

        let feasibility = self
            .scanner
            .check_feasibility_excluding(&current.step, &excluded)
            .await;
        if !feasibility.status.is_allocatable() {
            return Err(AllocationError::infeasible(
                &request.step_id,
                format!(
                    "no replacement resource ({}): {}",
                    feasibility.status.as_str(),
                    feasibility.errors.join("; ")
                ),
            ));
        }

        let placement = self
            .decider
            .decide_placement(&current.step, &feasibility, alloc_request)?;
        let mut bound = self
            .binder
            .bind_step(&allocation.allocation_id, &current.step, &placement, alloc_request)
            .await?;
        bound.attempt = current.attempt + 1;

        info!(
            "Step {} of allocation {} rebound from {} to {}",
            request.step_id,
            allocation.allocation_id,
            current.resource_id(),
            bound.resource_id()
        );
        Ok(self.prepper.prepare_step(bound, alloc_request))
    }
}
