use crate::binder::ResourceBinder;
use crate::dispatcher::{Dispatcher, ExecutionBackend, LoggingExecutor};
use crate::error::{AllocationError, AllocationResult, Phase};
use crate::estimator::{BaselineEstimator, CostEstimator, JitterEstimator};
use crate::feasibility::FeasibilityScanner;
use crate::metrics::compute_metrics;
use crate::placement::PlacementDecider;
use crate::prepper::ExecutionPrepper;
use crate::rebinder::AdaptiveRebinder;
use crate::registry::ResourceRegistry;
use crate::reservation_store::{InMemoryReservationStore, ReservationStore};
use crate::snapshot::{AllocatorSnapshot, RestoreReport};
use crate::store::{AllocationRecord, AllocationStore, InMemoryAllocationStore};
use crate::telemetry::AllocatorTelemetry;
use chrono::Utc;
use futures::future::join_all;
use intentmesh_config::AllocatorConfig;
use intentmesh_types::{
    AllocationMetrics, AllocationRequest, AllocationResponse, AllocationStatus, BoundStep,
    FeasibilityResult, PlacementDecision, RebindingRequest, ResourceAllocation,
};
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Coordination state for one allocation id.
///
/// `running` is held for the whole of an allocate or rebind call, so a
/// cancel that acquires it knows nothing else is writing reservations.
struct AllocationOp {
    cancelled: AtomicBool,
    notify: Notify,
    running: Mutex<()>,
    dispatch: StdMutex<Option<JoinHandle<()>>>,
}

impl AllocationOp {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
            running: Mutex::new(()),
            dispatch: StdMutex::new(None),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Set the cancel flag; false if it was already set
    fn cancel(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        first
    }

    async fn wait_cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    fn set_dispatch(&self, handle: JoinHandle<()>) {
        if let Ok(mut slot) = self.dispatch.lock() {
            *slot = Some(handle);
        }
    }

    fn take_dispatch(&self) -> Option<JoinHandle<()>> {
        self.dispatch.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Errors and warnings collected by a failed pipeline run
struct PipelineFailure {
    errors: Vec<String>,
    warnings: Vec<String>,
    cancelled: bool,
}

impl PipelineFailure {
    fn new(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            errors,
            warnings,
            cancelled: false,
        }
    }
}

impl From<AllocationError> for PipelineFailure {
    fn from(error: AllocationError) -> Self {
        Self {
            cancelled: matches!(error, AllocationError::Cancelled(_)),
            errors: vec![error.to_string()],
            warnings: Vec::new(),
        }
    }
}

/// Handle to the background maintenance task
pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Stop the task and wait for it to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Maintenance task ended abnormally: {}", e);
        }
    }
}

/// Builder for [`ResourceAllocator`]
pub struct AllocatorBuilder {
    registry: Arc<dyn ResourceRegistry>,
    config: AllocatorConfig,
    estimator: Option<Arc<dyn CostEstimator>>,
    backend: Option<Arc<dyn ExecutionBackend>>,
    store: Option<Arc<dyn AllocationStore>>,
    reservations: Option<Arc<dyn ReservationStore>>,
    telemetry: Option<AllocatorTelemetry>,
}

impl AllocatorBuilder {
    pub fn config(mut self, config: AllocatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn estimator(mut self, estimator: Arc<dyn CostEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn allocation_store(mut self, store: Arc<dyn AllocationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn reservation_store(mut self, reservations: Arc<dyn ReservationStore>) -> Self {
        self.reservations = Some(reservations);
        self
    }

    pub fn telemetry(mut self, telemetry: AllocatorTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn build(self) -> AllocationResult<ResourceAllocator> {
        self.config
            .validate()
            .map_err(|e| AllocationError::Internal(format!("invalid allocator config: {}", e)))?;

        let config = self.config;
        let telemetry = match self.telemetry {
            Some(telemetry) => telemetry,
            None => AllocatorTelemetry::new()
                .map_err(|e| {
                    AllocationError::Internal(format!("metrics registration failed: {}", e))
                })?,
        };
        let estimator = self.estimator.unwrap_or_else(|| {
            if config.feasibility.estimate_jitter > 0.0 {
                Arc::new(JitterEstimator::new(config.feasibility.estimate_jitter))
            } else {
                Arc::new(BaselineEstimator)
            }
        });
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryAllocationStore::new()));
        let reservations = self
            .reservations
            .unwrap_or_else(|| Arc::new(InMemoryReservationStore::new()));
        let backend = self.backend.unwrap_or_else(|| Arc::new(LoggingExecutor));

        let scanner = Arc::new(FeasibilityScanner::new(
            self.registry,
            estimator,
            config.feasibility.clone(),
        ));
        let decider = Arc::new(PlacementDecider::new(config.placement.clone()));
        let binder = Arc::new(ResourceBinder::new(reservations.clone(), config.binding.clone()));
        let rebinder = AdaptiveRebinder::new(
            scanner.clone(),
            decider.clone(),
            binder.clone(),
            config.rebinding.clone(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            backend,
            store.clone(),
            reservations.clone(),
            config.dispatch.clone(),
            telemetry.clone(),
        ));

        Ok(ResourceAllocator {
            config,
            scanner,
            decider,
            binder,
            prepper: ExecutionPrepper::new(),
            rebinder,
            dispatcher,
            store,
            reservations,
            telemetry,
            ops: Arc::new(RwLock::new(HashMap::new())),
        })
    }
}

/// Entry point for binding plans to resources.
///
/// Every public operation answers with a structured response or an `Option`;
/// pipeline errors are recorded on the allocation, never propagated.
pub struct ResourceAllocator {
    config: AllocatorConfig,
    scanner: Arc<FeasibilityScanner>,
    decider: Arc<PlacementDecider>,
    binder: Arc<ResourceBinder>,
    prepper: ExecutionPrepper,
    rebinder: AdaptiveRebinder,
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn AllocationStore>,
    reservations: Arc<dyn ReservationStore>,
    telemetry: AllocatorTelemetry,
    ops: Arc<RwLock<HashMap<String, Arc<AllocationOp>>>>,
}

impl ResourceAllocator {
    pub fn builder(registry: Arc<dyn ResourceRegistry>) -> AllocatorBuilder {
        AllocatorBuilder {
            registry,
            config: AllocatorConfig::default(),
            estimator: None,
            backend: None,
            store: None,
            reservations: None,
            telemetry: None,
        }
    }

    /// Allocator with in-memory stores and the logging executor
    pub fn new(
        registry: Arc<dyn ResourceRegistry>,
        config: AllocatorConfig,
    ) -> AllocationResult<Self> {
        Self::builder(registry).config(config).build()
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &AllocatorTelemetry {
        &self.telemetry
    }

    pub fn reservation_store(&self) -> Arc<dyn ReservationStore> {
        self.reservations.clone()
    }

    /// Allocate a plan under a fresh allocation id
    pub async fn allocate_resources(&self, request: AllocationRequest) -> AllocationResponse {
        let allocation_id = format!("alloc-{}", Uuid::new_v4());
        self.allocate_resources_with_id(&allocation_id, request).await
    }

    /// Allocate a plan under a caller-chosen id.
    ///
    /// Returns with status `reserved` once every step holds a reservation;
    /// dispatch continues in the background.
    pub async fn allocate_resources_with_id(
        &self,
        allocation_id: &str,
        request: AllocationRequest,
    ) -> AllocationResponse {
        info!(
            "Allocating plan {} ({} steps) for user {} as {}",
            request.plan_id(),
            request.plan.steps.len(),
            request.user_id,
            allocation_id
        );

        if let Err(e) = self
            .store
            .insert(AllocationRecord::pending(allocation_id, request.clone()))
            .await
        {
            self.telemetry.record_allocation("rejected");
            return AllocationResponse::rejected(
                allocation_id,
                AllocationStatus::Failed,
                vec![e.to_string()],
                Vec::new(),
            );
        }

        let op = self.op_for(allocation_id).await;
        let _running = op.running.lock().await;

        let outcome = tokio::select! {
            biased;
            _ = op.wait_cancelled() => Err(PipelineFailure::from(AllocationError::Cancelled(
                allocation_id.to_string(),
            ))),
            result = self.run_pipeline(allocation_id, &request, &op) => result,
        };

        match outcome {
            Ok((allocation, warnings)) => {
                self.telemetry.record_allocation("reserved");
                info!(
                    "Allocation {} reserved {} step(s), expected cost ${:.4}, latency {:.0}ms",
                    allocation_id,
                    allocation.bound_steps.len(),
                    allocation.expected_cost,
                    allocation.expected_latency_ms
                );
                AllocationResponse::from_allocation(&allocation, warnings)
            }
            Err(failure) if failure.cancelled || op.is_cancelled() => {
                // cancel_allocation finishes the cleanup once `running` is released
                info!("Allocation {} cancelled while in flight", allocation_id);
                AllocationResponse::rejected(
                    allocation_id,
                    AllocationStatus::Cancelled,
                    vec![format!("allocation {} was cancelled", allocation_id)],
                    failure.warnings,
                )
            }
            Err(failure) => {
                self.telemetry.record_allocation("failed");
                let status = self.fail_allocation(allocation_id, &failure.errors).await;
                AllocationResponse::rejected(
                    allocation_id,
                    status,
                    failure.errors,
                    failure.warnings,
                )
            }
        }
    }

    async fn run_pipeline(
        &self,
        allocation_id: &str,
        request: &AllocationRequest,
        op: &Arc<AllocationOp>,
    ) -> Result<(ResourceAllocation, Vec<String>), PipelineFailure> {
        validate_plan(request)?;
        let mut warnings = Vec::new();

        self.store
            .transition(allocation_id, AllocationStatus::FeasibilityCheck, None)
            .await?;
        let feasibility = self.scan_steps(request).await;

        let mut errors = Vec::new();
        for result in &feasibility {
            warnings.extend(
                result
                    .warnings
                    .iter()
                    .map(|w| format!("step {}: {}", result.step_id, w)),
            );
            if !result.status.is_allocatable() {
                let reason = if result.errors.is_empty() {
                    "no feasible resource".to_string()
                } else {
                    result.errors.join("; ")
                };
                errors.push(format!(
                    "step {} is {}: {}",
                    result.step_id,
                    result.status.as_str(),
                    reason
                ));
            }
        }
        if !errors.is_empty() {
            warn!(
                "Allocation {} is infeasible: {}",
                allocation_id,
                errors.join(" | ")
            );
            return Err(PipelineFailure::new(errors, warnings));
        }

        self.store
            .transition(allocation_id, AllocationStatus::PlacementDecision, None)
            .await?;
        let placements = match self.place_steps(request, &feasibility).await {
            Ok(placements) => placements,
            Err(errors) => return Err(PipelineFailure::new(errors, warnings)),
        };
        for placement in &placements {
            warnings.extend(
                placement
                    .warnings
                    .iter()
                    .map(|w| format!("step {}: {}", placement.step_id, w)),
            );
        }

        self.store
            .transition(allocation_id, AllocationStatus::Binding, None)
            .await?;
        let started = Instant::now();
        let bound_steps = match self
            .bind_steps(allocation_id, request, placements, &mut warnings)
            .await
        {
            Ok(bound_steps) => bound_steps,
            Err(e) => {
                self.telemetry
                    .record_binding("failed", started.elapsed().as_secs_f64());
                return Err(PipelineFailure::new(vec![e.to_string()], warnings));
            }
        };
        let binding_latency = started.elapsed();
        self.telemetry
            .record_binding("reserved", binding_latency.as_secs_f64());

        let bound_steps: Vec<BoundStep> = bound_steps
            .into_iter()
            .map(|bound| self.prepper.prepare_step(bound, request))
            .collect();

        let allocation = ResourceAllocation::assemble(
            allocation_id,
            request,
            AllocationStatus::Reserved,
            bound_steps,
            binding_latency.as_secs_f64() * 1_000.0,
        );
        let metrics = compute_metrics(&allocation, request);
        let record = AllocationRecord {
            allocation: allocation.clone(),
            request: request.clone(),
            metrics: Some(metrics),
            warnings: warnings.clone(),
        };
        self.store
            .publish(allocation_id, AllocationStatus::Binding, record)
            .await?;

        self.spawn_dispatch(op, allocation.clone());
        Ok((allocation, warnings))
    }

    /// Feasibility for every step, one task per step; a failed task only affects its own step
    async fn scan_steps(&self, request: &AllocationRequest) -> Vec<FeasibilityResult> {
        let timeout = self.config.timeouts.feasibility();
        let handles: Vec<_> = request
            .plan
            .steps
            .iter()
            .cloned()
            .map(|step| {
                let scanner = self.scanner.clone();
                tokio::spawn(async move {
                    match tokio::time::timeout(timeout, scanner.check_feasibility(&step)).await {
                        Ok(result) => result,
                        Err(_) => FeasibilityResult::unknown(
                            &step.step_id,
                            AllocationError::Timeout {
                                phase: Phase::Feasibility,
                                step_id: step.step_id.clone(),
                                timeout_ms: timeout.as_millis() as u64,
                            }
                            .to_string(),
                        ),
                    }
                })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .zip(&request.plan.steps)
            .map(|(joined, step)| {
                joined.unwrap_or_else(|e| {
                    error!("Feasibility task for step {} failed: {}", step.step_id, e);
                    FeasibilityResult::unknown(
                        &step.step_id,
                        format!("feasibility task failed: {}", e),
                    )
                })
            })
            .collect()
    }

    /// Placement for every step, one task per step; errors are collected per step
    async fn place_steps(
        &self,
        request: &AllocationRequest,
        feasibility: &[FeasibilityResult],
    ) -> Result<Vec<PlacementDecision>, Vec<String>> {
        let timeout = self.config.timeouts.placement();
        let shared_request = Arc::new(request.clone());
        let handles: Vec<_> = request
            .plan
            .steps
            .iter()
            .cloned()
            .zip(feasibility.iter().cloned())
            .map(|(step, result)| {
                let decider = self.decider.clone();
                let request = shared_request.clone();
                tokio::spawn(async move { decider.decide_placement(&step, &result, &request) })
            })
            .collect();

        let outcomes = join_all(handles.into_iter().zip(&request.plan.steps).map(
            |(handle, step)| async move {
                match tokio::time::timeout(timeout, handle).await {
                    Ok(Ok(decision)) => decision,
                    Ok(Err(e)) => Err(AllocationError::Internal(format!(
                        "placement task for step {} failed: {}",
                        step.step_id, e
                    ))),
                    Err(_) => Err(AllocationError::Timeout {
                        phase: Phase::Placement,
                        step_id: step.step_id.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            },
        ))
        .await;

        let mut placements = Vec::new();
        let mut errors = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(decision) => placements.push(decision),
                Err(e) => errors.push(e.to_string()),
            }
        }
        if errors.is_empty() {
            Ok(placements)
        } else {
            Err(errors)
        }
    }

    /// Reserve steps one at a time in plan order
    async fn bind_steps(
        &self,
        allocation_id: &str,
        request: &AllocationRequest,
        placements: Vec<PlacementDecision>,
        warnings: &mut Vec<String>,
    ) -> AllocationResult<Vec<BoundStep>> {
        let timeout = self.config.timeouts.binding();
        let mut bound_steps = Vec::with_capacity(placements.len());

        for (step, placement) in request.plan.steps.iter().zip(placements) {
            let bound = match tokio::time::timeout(
                timeout,
                self.binder.bind_step(allocation_id, step, &placement, request),
            )
            .await
            {
                Ok(Ok(bound)) => bound,
                Ok(Err(e)) => {
                    if matches!(e, AllocationError::Conflict { .. }) {
                        self.telemetry.reservation_conflicts.inc();
                    }
                    return Err(e);
                }
                Err(_) => {
                    return Err(AllocationError::Timeout {
                        phase: Phase::Binding,
                        step_id: step.step_id.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            };

            if bound.used_fallback {
                self.telemetry.reservation_conflicts.inc();
                warnings.push(format!(
                    "step {}: primary {} was taken, bound fallback {}",
                    step.step_id,
                    placement.primary_resource.resource_id,
                    bound.resource_id()
                ));
            }
            bound_steps.push(bound);
        }

        Ok(bound_steps)
    }

    fn spawn_dispatch(&self, op: &Arc<AllocationOp>, allocation: ResourceAllocation) {
        let dispatcher = self.dispatcher.clone();
        let ops = self.ops.clone();
        let owner = Arc::clone(op);
        let handle = tokio::spawn(async move {
            let allocation_id = allocation.allocation_id.clone();
            let status = dispatcher.dispatch_allocation(allocation).await;
            debug!("Dispatch of {} finished as {}", allocation_id, status);
            if status.is_terminal() {
                let mut ops = ops.write().await;
                if ops
                    .get(&allocation_id)
                    .is_some_and(|current| Arc::ptr_eq(current, &owner))
                {
                    ops.remove(&allocation_id);
                }
            }
        });
        op.set_dispatch(handle);
    }

    /// Mark an allocation failed and release everything it holds; returns the final status
    async fn fail_allocation(&self, allocation_id: &str, errors: &[String]) -> AllocationStatus {
        let note = errors.join("; ");
        let status = match self
            .store
            .transition(allocation_id, AllocationStatus::Failed, Some(note))
            .await
        {
            Ok(record) => record.status(),
            Err(e) => {
                warn!("Could not mark allocation {} failed: {}", allocation_id, e);
                self.get_allocation_status(allocation_id)
                    .await
                    .unwrap_or(AllocationStatus::Failed)
            }
        };

        match self.binder.release_allocation(allocation_id).await {
            Ok(released) if !released.is_empty() => info!(
                "Released {} reservation(s) of failed allocation {}",
                released.len(),
                allocation_id
            ),
            Ok(_) => {}
            Err(e) => error!(
                "Failed to release reservations of allocation {}: {}",
                allocation_id, e
            ),
        }

        if status.is_terminal() {
            self.ops.write().await.remove(allocation_id);
        }
        status
    }

    async fn op_for(&self, allocation_id: &str) -> Arc<AllocationOp> {
        let mut ops = self.ops.write().await;
        ops.entry(allocation_id.to_string())
            .or_insert_with(|| Arc::new(AllocationOp::new()))
            .clone()
    }

    /// Wait for an in-flight dispatch within the rebinding timeout.
    ///
    /// A dispatch still running at the deadline is handed back to the op so a
    /// later cancel can abort it.
    async fn settle_dispatch(
        &self,
        op: &AllocationOp,
        allocation_id: &str,
        step_id: &str,
    ) -> AllocationResult<()> {
        let Some(mut dispatch) = op.take_dispatch() else {
            return Ok(());
        };
        let timeout = self.rebinder.config().timeout();

        let settled = tokio::select! {
            biased;
            _ = op.wait_cancelled() => None,
            joined = tokio::time::timeout(timeout, &mut dispatch) => Some(joined),
        };

        match settled {
            None => {
                dispatch.abort();
                Err(AllocationError::Cancelled(allocation_id.to_string()))
            }
            Some(Ok(Ok(()))) => Ok(()),
            Some(Ok(Err(e))) => {
                debug!("Dispatch task of {} ended early: {}", allocation_id, e);
                Ok(())
            }
            Some(Err(_)) => {
                warn!(
                    "Dispatch of {} still running after {}ms, not rebinding",
                    allocation_id,
                    timeout.as_millis()
                );
                op.set_dispatch(dispatch);
                // a cancel that ran while the handle was out found nothing to abort
                if op.is_cancelled() {
                    if let Some(dispatch) = op.take_dispatch() {
                        dispatch.abort();
                    }
                }
                Err(AllocationError::Timeout {
                    phase: Phase::Rebinding,
                    step_id: step_id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Cancel an allocation, interrupting any allocate or rebind in flight.
    ///
    /// Returns true only for the call that moved the allocation to `cancelled`.
    pub async fn cancel_allocation(&self, allocation_id: &str) -> bool {
        match self.store.get(allocation_id).await {
            Ok(Some(record)) if !record.status().is_terminal() => {}
            Ok(_) => return false,
            Err(e) => {
                warn!("Cancel of {} could not read the allocation: {}", allocation_id, e);
                return false;
            }
        }

        let op = self.op_for(allocation_id).await;
        if !op.cancel() {
            return false;
        }
        if let Some(dispatch) = op.take_dispatch() {
            dispatch.abort();
        }

        let _running = op.running.lock().await;

        let released = match self.binder.release_allocation(allocation_id).await {
            Ok(released) => released.len(),
            Err(e) => {
                error!(
                    "Failed to release reservations of cancelled allocation {}: {}",
                    allocation_id, e
                );
                0
            }
        };
        let cancelled = match self
            .store
            .transition(
                allocation_id,
                AllocationStatus::Cancelled,
                Some("cancelled by request".to_string()),
            )
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("Allocation {} could not be cancelled: {}", allocation_id, e);
                false
            }
        };
        self.ops.write().await.remove(allocation_id);

        if cancelled {
            self.telemetry.record_allocation("cancelled");
            info!(
                "Cancelled allocation {}, released {} reservation(s)",
                allocation_id, released
            );
        }
        cancelled
    }

    /// Move one step of an allocation to another resource
    pub async fn rebind_resources(&self, request: RebindingRequest) -> AllocationResponse {
        let allocation_id = request.allocation_id.clone();
        match self.store.get(&allocation_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return AllocationResponse::rejected(
                    &allocation_id,
                    AllocationStatus::Failed,
                    vec![AllocationError::NotFound(allocation_id.clone()).to_string()],
                    Vec::new(),
                )
            }
            Err(e) => {
                return AllocationResponse::rejected(
                    &allocation_id,
                    AllocationStatus::Failed,
                    vec![e.to_string()],
                    Vec::new(),
                )
            }
        }

        let op = self.op_for(&allocation_id).await;
        if let Err(e) = self
            .settle_dispatch(&op, &allocation_id, &request.step_id)
            .await
        {
            if matches!(e, AllocationError::Cancelled(_)) {
                return AllocationResponse::rejected(
                    &allocation_id,
                    AllocationStatus::Cancelled,
                    vec![e.to_string()],
                    Vec::new(),
                );
            }
            self.telemetry.record_rebind("timeout");
            return match self.get_record(&allocation_id).await {
                Some(record) => {
                    AllocationResponse::from_allocation(&record.allocation, record.warnings)
                        .with_errors(vec![e.to_string()])
                }
                None => AllocationResponse::rejected(
                    &allocation_id,
                    AllocationStatus::Failed,
                    vec![e.to_string()],
                    Vec::new(),
                ),
            };
        }
        let _running = op.running.lock().await;

        let record = match self.store.get(&allocation_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return AllocationResponse::rejected(
                    &allocation_id,
                    AllocationStatus::Cancelled,
                    vec![AllocationError::NotFound(allocation_id.clone()).to_string()],
                    Vec::new(),
                )
            }
            Err(e) => {
                return AllocationResponse::rejected(
                    &allocation_id,
                    AllocationStatus::Failed,
                    vec![e.to_string()],
                    Vec::new(),
                )
            }
        };
        let prior = record.status();

        if op.is_cancelled() || !prior.can_transition_to(AllocationStatus::Rebinding) {
            let error = AllocationError::InvalidTransition {
                from: prior,
                to: AllocationStatus::Rebinding,
            };
            return AllocationResponse::from_allocation(&record.allocation, record.warnings.clone())
                .with_errors(vec![error.to_string()]);
        }

        let Some(current) = record.allocation.bound_step(&request.step_id) else {
            return AllocationResponse::from_allocation(&record.allocation, record.warnings.clone())
                .with_errors(vec![format!(
                    "allocation {} has no step {}",
                    allocation_id, request.step_id
                )]);
        };
        let old_reservation_id = current.reservation.reservation_id.clone();

        let attempts = record.allocation.rebind_attempts_for(&request.step_id);
        if attempts >= self.rebinder.config().max_attempts {
            let error = AllocationError::RebindExhausted {
                step_id: request.step_id.clone(),
                attempts,
            };
            self.telemetry.record_rebind("exhausted");
            let status = self.fail_allocation(&allocation_id, &[error.to_string()]).await;
            return AllocationResponse::rejected(
                &allocation_id,
                status,
                vec![error.to_string()],
                record.warnings,
            );
        }

        if let Err(e) = self
            .store
            .transition(&allocation_id, AllocationStatus::Rebinding, None)
            .await
        {
            return AllocationResponse::from_allocation(&record.allocation, record.warnings.clone())
                .with_errors(vec![e.to_string()]);
        }

        let outcome = tokio::select! {
            biased;
            _ = op.wait_cancelled() => Err(AllocationError::Cancelled(allocation_id.clone())),
            result = self
                .rebinder
                .rebind_step(&request, &record.allocation, &record.request) => result,
        };

        match outcome {
            Ok(mut rebound) => {
                rebound.status = AllocationStatus::Reserved;
                *rebound
                    .rebind_attempts
                    .entry(request.step_id.clone())
                    .or_insert(0) += 1;
                rebound.last_error = None;
                if !matches!(prior, AllocationStatus::Reserved) {
                    rebound.execution_handle = None;
                }

                let mut warnings = record.warnings.clone();
                warnings.push(format!(
                    "step {} rebound from {} ({})",
                    request.step_id, request.current_resource_id, request.reason
                ));
                let updated = AllocationRecord {
                    metrics: Some(compute_metrics(&rebound, &record.request)),
                    allocation: rebound.clone(),
                    request: record.request.clone(),
                    warnings: warnings.clone(),
                };

                if let Err(e) = self
                    .store
                    .publish(&allocation_id, AllocationStatus::Rebinding, updated)
                    .await
                {
                    let keep: HashSet<String> =
                        record.allocation.reservation_ids().into_iter().collect();
                    if let Err(re) = self.binder.release_orphans(&allocation_id, &keep).await {
                        error!(
                            "Failed to release rebinding reservations of {}: {}",
                            allocation_id, re
                        );
                    }
                    return AllocationResponse::from_allocation(&record.allocation, warnings)
                        .with_errors(vec![e.to_string()]);
                }

                if let Err(e) = self
                    .binder
                    .release_reservations(&[old_reservation_id])
                    .await
                {
                    warn!("Failed to release replaced reservation of {}: {}", allocation_id, e);
                }
                self.telemetry.record_rebind("rebound");

                if matches!(prior, AllocationStatus::Dispatched | AllocationStatus::Executing) {
                    self.spawn_dispatch(&op, rebound.clone());
                }
                AllocationResponse::from_allocation(&rebound, warnings)
            }
            Err(AllocationError::Cancelled(_)) => AllocationResponse::rejected(
                &allocation_id,
                AllocationStatus::Cancelled,
                vec![format!("allocation {} was cancelled", allocation_id)],
                record.warnings,
            ),
            Err(e) => {
                self.telemetry.record_rebind("failed");
                let attempts = match self
                    .store
                    .record_rebind_attempt(&allocation_id, &request.step_id)
                    .await
                {
                    Ok(attempts) => attempts,
                    Err(se) => {
                        warn!("Failed to count rebind attempt of {}: {}", allocation_id, se);
                        self.rebinder.config().max_attempts
                    }
                };

                let mut errors = vec![e.to_string()];
                if attempts >= self.rebinder.config().max_attempts {
                    errors.push(
                        AllocationError::RebindExhausted {
                            step_id: request.step_id.clone(),
                            attempts,
                        }
                        .to_string(),
                    );
                    let status = self.fail_allocation(&allocation_id, &errors).await;
                    return AllocationResponse::rejected(
                        &allocation_id,
                        status,
                        errors,
                        record.warnings,
                    );
                }

                match self
                    .store
                    .transition(&allocation_id, AllocationStatus::Reserved, Some(e.to_string()))
                    .await
                {
                    Ok(reverted) => {
                        AllocationResponse::from_allocation(&reverted.allocation, reverted.warnings)
                            .with_errors(errors)
                    }
                    Err(te) => {
                        errors.push(te.to_string());
                        AllocationResponse::from_allocation(&record.allocation, record.warnings)
                            .with_errors(errors)
                    }
                }
            }
        }
    }

    /// Executor feedback: execution has started
    pub async fn report_execution_started(&self, allocation_id: &str) -> bool {
        match self
            .store
            .transition(allocation_id, AllocationStatus::Executing, None)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!("Ignoring start report for {}: {}", allocation_id, e);
                false
            }
        }
    }

    /// Executor feedback: execution finished; reservations are released either way
    pub async fn report_execution_finished(
        &self,
        allocation_id: &str,
        success: bool,
        detail: Option<String>,
    ) -> bool {
        let next = if success {
            AllocationStatus::Completed
        } else {
            AllocationStatus::Failed
        };
        if let Err(e) = self.store.transition(allocation_id, next, detail).await {
            debug!("Ignoring finish report for {}: {}", allocation_id, e);
            return false;
        }

        if let Err(e) = self.binder.release_allocation(allocation_id).await {
            error!(
                "Failed to release reservations of finished allocation {}: {}",
                allocation_id, e
            );
        }
        self.ops.write().await.remove(allocation_id);
        self.telemetry
            .record_allocation(if success { "completed" } else { "failed" });
        true
    }

    /// Drop reservations nobody consumed in time and fail their undispatched allocations
    pub async fn expire_stale_reservations(&self) -> usize {
        let expired = match self.binder.expire_stale(Utc::now()).await {
            Ok(expired) => expired,
            Err(e) => {
                error!("Reservation expiry sweep failed: {}", e);
                return 0;
            }
        };
        if expired.is_empty() {
            return 0;
        }

        let allocation_ids: HashSet<&str> =
            expired.iter().map(|r| r.allocation_id.as_str()).collect();
        for allocation_id in allocation_ids {
            if self.get_allocation_status(allocation_id).await == Some(AllocationStatus::Reserved) {
                warn!(
                    "Reservations of allocation {} expired before dispatch",
                    allocation_id
                );
                self.fail_allocation(
                    allocation_id,
                    &["reservation expired before dispatch".to_string()],
                )
                .await;
            }
        }

        info!("Expired {} stale reservation(s)", expired.len());
        expired.len()
    }

    /// Start the periodic reservation expiry sweep
    pub fn start_maintenance(self: &Arc<Self>) -> MaintenanceHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let allocator = Arc::clone(self);
        let period = self.config.binding.expiry_sweep_interval();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        allocator.expire_stale_reservations().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Allocator maintenance stopping");
                            break;
                        }
                    }
                }
            }
        });

        MaintenanceHandle { shutdown, task }
    }

    pub async fn get_allocation_status(&self, allocation_id: &str) -> Option<AllocationStatus> {
        self.get_record(allocation_id).await.map(|r| r.status())
    }

    pub async fn get_allocation(&self, allocation_id: &str) -> Option<ResourceAllocation> {
        self.get_record(allocation_id).await.map(|r| r.allocation)
    }

    /// Metrics recomputed from the allocation's current state
    pub async fn get_allocation_metrics(&self, allocation_id: &str) -> Option<AllocationMetrics> {
        self.get_record(allocation_id)
            .await
            .map(|record| compute_metrics(&record.allocation, &record.request))
    }

    pub async fn list_allocations(&self) -> Vec<ResourceAllocation> {
        match self.store.list().await {
            Ok(records) => records.into_iter().map(|r| r.allocation).collect(),
            Err(e) => {
                warn!("Failed to list allocations: {}", e);
                Vec::new()
            }
        }
    }

    async fn get_record(&self, allocation_id: &str) -> Option<AllocationRecord> {
        match self.store.get(allocation_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to read allocation {}: {}", allocation_id, e);
                None
            }
        }
    }

    pub async fn snapshot(&self) -> AllocationResult<AllocatorSnapshot> {
        AllocatorSnapshot::capture(self.store.as_ref(), self.reservations.as_ref()).await
    }

    /// Load a snapshot into this allocator's (empty) stores
    pub async fn restore(&self, snapshot: &AllocatorSnapshot) -> AllocationResult<RestoreReport> {
        let report = snapshot
            .restore_into(self.store.as_ref(), self.reservations.as_ref())
            .await?;
        info!(
            "Restored {} allocation(s) and {} reservation(s)",
            report.records, report.reservations
        );
        Ok(report)
    }
}

/// Structural checks the planner is expected to satisfy
fn validate_plan(request: &AllocationRequest) -> AllocationResult<()> {
    if request.plan.steps.is_empty() {
        return Err(AllocationError::Internal(format!(
            "plan {} has no steps",
            request.plan_id()
        )));
    }
    let mut seen = HashSet::new();
    for step in &request.plan.steps {
        if !seen.insert(step.step_id.as_str()) {
            return Err(AllocationError::Internal(format!(
                "plan {} repeats step id {}",
                request.plan_id(),
                step.step_id
            )));
        }
    }
    Ok(())
}
