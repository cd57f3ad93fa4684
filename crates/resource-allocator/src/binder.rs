use crate::error::{AllocationError, AllocationResult};
use crate::placement::rebase_decision;
use crate::reservation_store::{ReservationError, ReservationStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use intentmesh_config::BindingConfig;
use intentmesh_types::{
    AllocationRequest, BoundStep, ExecutionStep, PlacementDecision, ResourceCapability,
    ResourceReservation, RunConfiguration, StepType,
};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Whether a reservation on this resource for this step must be exclusive
pub fn requires_exclusive(step: &ExecutionStep, resource: &ResourceCapability) -> bool {
    resource.resource_type.is_local_hardware() || step.step_type == StepType::DeviceControl
}

/// Turns placement decisions into reservations
pub struct ResourceBinder {
    store: Arc<dyn ReservationStore>,
    config: BindingConfig,
}

impl ResourceBinder {
    pub fn new(store: Arc<dyn ReservationStore>, config: BindingConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> Arc<dyn ReservationStore> {
        self.store.clone()
    }

    /// Reserve the placement's primary resource, falling back in order when it is taken.
    ///
    /// The returned step carries an empty run configuration; preparation fills it in.
    pub async fn bind_step(
        &self,
        allocation_id: &str,
        step: &ExecutionStep,
        placement: &PlacementDecision,
        request: &AllocationRequest,
    ) -> AllocationResult<BoundStep> {
        let now = Utc::now();
        let (start_time, end_time) = self.window(step, request, now)?;

        let candidates =
            std::iter::once(&placement.primary_resource).chain(placement.fallback_resources.iter());
        let mut conflicts = Vec::new();

        for (index, candidate) in candidates.enumerate() {
            let reservation = ResourceReservation {
                reservation_id: format!("res-{}", Uuid::new_v4()),
                allocation_id: allocation_id.to_string(),
                resource_id: candidate.resource_id.clone(),
                step_id: step.step_id.clone(),
                start_time,
                end_time,
                priority: request.priority,
                exclusive: requires_exclusive(step, candidate),
                created_at: now,
                consume_by: now + self.reservation_timeout(),
                consumed: false,
            };

            match self
                .store
                .try_reserve(reservation, candidate.available_slots)
                .await
            {
                Ok(reservation) => {
                    let used_fallback = index > 0;
                    let placement = if used_fallback {
                        let note = format!(
                            "bound fallback {} after {}",
                            candidate.resource_id,
                            conflicts.join(", ")
                        );
                        info!(
                            "Step {} of allocation {} bound to fallback {}",
                            step.step_id, allocation_id, candidate.resource_id
                        );
                        rebase_decision(step, placement, candidate, &note)
                    } else {
                        debug!(
                            "Step {} of allocation {} bound to {}",
                            step.step_id, allocation_id, candidate.resource_id
                        );
                        placement.clone()
                    };

                    return Ok(BoundStep {
                        step: step.clone(),
                        placement,
                        reservation,
                        run_config: RunConfiguration::default(),
                        used_fallback,
                        attempt: 1,
                        bound_at: Utc::now(),
                    });
                }
                Err(
                    e @ (ReservationError::ExclusiveConflict { .. }
                    | ReservationError::CapacityExceeded { .. }),
                ) => {
                    debug!("Reservation on {} refused: {}", candidate.resource_id, e);
                    conflicts.push(e.to_string());
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(
            "No candidate could be reserved for step {} of allocation {}",
            step.step_id, allocation_id
        );
        Err(AllocationError::Conflict {
            step_id: step.step_id.clone(),
            reason: conflicts.join("; "),
        })
    }

    /// Release reservations by id
    pub async fn release_reservations(
        &self,
        reservation_ids: &[String],
    ) -> AllocationResult<usize> {
        Ok(self.store.release(reservation_ids).await?)
    }

    /// Release everything an allocation holds
    pub async fn release_allocation(
        &self,
        allocation_id: &str,
    ) -> AllocationResult<Vec<ResourceReservation>> {
        let released = self.store.release_allocation(allocation_id).await?;
        if !released.is_empty() {
            debug!(
                "Released {} reservation(s) held by allocation {}",
                released.len(),
                allocation_id
            );
        }
        Ok(released)
    }

    /// Release an allocation's reservations except those listed in `keep`
    pub async fn release_orphans(
        &self,
        allocation_id: &str,
        keep: &HashSet<String>,
    ) -> AllocationResult<usize> {
        let orphans: Vec<String> = self
            .store
            .reservations_for_allocation(allocation_id)
            .await?
            .into_iter()
            .map(|r| r.reservation_id)
            .filter(|id| !keep.contains(id))
            .collect();

        if orphans.is_empty() {
            return Ok(0);
        }
        warn!(
            "Releasing {} orphaned reservation(s) of allocation {}",
            orphans.len(),
            allocation_id
        );
        self.release_reservations(&orphans).await
    }

    /// Mark reservations consumed by dispatch
    pub async fn consume(&self, reservation_ids: &[String]) -> AllocationResult<usize> {
        Ok(self.store.mark_consumed(reservation_ids).await?)
    }

    /// Drop reservations whose consume-by deadline has passed
    pub async fn expire_stale(
        &self,
        now: DateTime<Utc>,
    ) -> AllocationResult<Vec<ResourceReservation>> {
        Ok(self.store.expire_unconsumed(now).await?)
    }

    fn reservation_timeout(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.config.reservation_timeout())
            .unwrap_or_else(|_| ChronoDuration::seconds(1800))
    }

    fn window(
        &self,
        step: &ExecutionStep,
        request: &AllocationRequest,
        now: DateTime<Utc>,
    ) -> AllocationResult<(DateTime<Utc>, DateTime<Utc>)> {
        let duration_ms = if step.estimated_duration_ms > 0 {
            step.estimated_duration_ms
        } else {
            self.config.default_step_duration_ms.max(1)
        };
        let mut end = now + ChronoDuration::milliseconds(duration_ms.min(i64::MAX as u64) as i64);

        if let Some(deadline) = request.deadline {
            if deadline <= now {
                return Err(AllocationError::infeasible(
                    &step.step_id,
                    format!("deadline {} has already passed", deadline),
                ));
            }
            end = end.min(deadline);
        }

        Ok((now, end))
    }
}
