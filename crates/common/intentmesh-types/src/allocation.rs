use crate::binding::BoundStep;
use crate::plan::{ExecutionPlan, PrivacyClass};
use crate::reservation::ResourceReservation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Lifecycle state of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    /// Accepted, nothing evaluated yet
    Pending,
    /// Feasibility scans are running
    FeasibilityCheck,
    /// Placement decisions are being made
    PlacementDecision,
    /// Reservations are being taken
    Binding,
    /// Every step holds a reservation
    Reserved,
    /// Handed to the executor
    Dispatched,
    /// Executor reported that execution started
    Executing,
    /// A step is being moved to another resource
    Rebinding,
    Completed,
    Failed,
    Cancelled,
}

impl AllocationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AllocationStatus::Completed | AllocationStatus::Failed | AllocationStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: AllocationStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            AllocationStatus::Failed | AllocationStatus::Cancelled => true,
            AllocationStatus::FeasibilityCheck => *self == AllocationStatus::Pending,
            AllocationStatus::PlacementDecision => *self == AllocationStatus::FeasibilityCheck,
            AllocationStatus::Binding => *self == AllocationStatus::PlacementDecision,
            AllocationStatus::Reserved => {
                matches!(self, AllocationStatus::Binding | AllocationStatus::Rebinding)
            }
            AllocationStatus::Dispatched => *self == AllocationStatus::Reserved,
            AllocationStatus::Executing => *self == AllocationStatus::Dispatched,
            AllocationStatus::Rebinding => matches!(
                self,
                AllocationStatus::Reserved
                    | AllocationStatus::Dispatched
                    | AllocationStatus::Executing
            ),
            AllocationStatus::Completed => {
                matches!(self, AllocationStatus::Dispatched | AllocationStatus::Executing)
            }
            AllocationStatus::Pending => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Pending => "pending",
            AllocationStatus::FeasibilityCheck => "feasibility_check",
            AllocationStatus::PlacementDecision => "placement_decision",
            AllocationStatus::Binding => "binding",
            AllocationStatus::Reserved => "reserved",
            AllocationStatus::Dispatched => "dispatched",
            AllocationStatus::Executing => "executing",
            AllocationStatus::Rebinding => "rebinding",
            AllocationStatus::Completed => "completed",
            AllocationStatus::Failed => "failed",
            AllocationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Privacy requirements attached to a request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrivacyRequirements {
    /// Score placements with the privacy-first strategy
    #[serde(default)]
    pub privacy_first: bool,

    /// Class applied to every step without a class of its own
    #[serde(default)]
    pub data_class: Option<PrivacyClass>,

    /// Per-step overrides keyed by step id
    #[serde(default)]
    pub step_classes: HashMap<String, PrivacyClass>,
}

/// Energy constraints attached to a request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyConstraints {
    /// Score placements with the energy-efficient strategy
    #[serde(default)]
    pub energy_efficient: bool,

    /// Energy budget for the whole plan in watt-hours
    #[serde(default)]
    pub max_energy_wh: Option<f64>,
}

fn default_priority() -> u8 {
    50
}

/// Request to bind a plan to resources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRequest {
    /// Plan to allocate
    pub plan: ExecutionPlan,

    /// Requesting user
    pub user_id: String,

    /// Priority (1-100)
    #[serde(default = "default_priority")]
    pub priority: u8,

    /// Latest acceptable end of any reservation window
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,

    /// Cost budget in dollars
    #[serde(default)]
    pub cost_budget: Option<f64>,

    /// Latency budget in milliseconds
    #[serde(default)]
    pub latency_budget_ms: Option<f64>,

    #[serde(default)]
    pub privacy_requirements: PrivacyRequirements,

    #[serde(default)]
    pub energy_constraints: EnergyConstraints,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AllocationRequest {
    pub fn new(plan: ExecutionPlan, user_id: impl Into<String>) -> Self {
        Self {
            plan,
            user_id: user_id.into(),
            priority: default_priority(),
            deadline: None,
            cost_budget: None,
            latency_budget_ms: None,
            privacy_requirements: PrivacyRequirements::default(),
            energy_constraints: EnergyConstraints::default(),
            metadata: HashMap::new(),
        }
    }

    pub fn plan_id(&self) -> &str {
        &self.plan.plan_id
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cost_budget(mut self, budget: f64) -> Self {
        self.cost_budget = Some(budget);
        self
    }

    pub fn with_latency_budget_ms(mut self, budget_ms: f64) -> Self {
        self.latency_budget_ms = Some(budget_ms);
        self
    }

    pub fn privacy_first(mut self) -> Self {
        self.privacy_requirements.privacy_first = true;
        self
    }

    pub fn energy_efficient(mut self) -> Self {
        self.energy_constraints.energy_efficient = true;
        self
    }
}

/// One plan bound to resources; the unit of lifecycle management
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub allocation_id: String,

    pub plan_id: String,

    pub user_id: String,

    pub status: AllocationStatus,

    /// Bound steps in plan order
    pub bound_steps: Vec<BoundStep>,

    /// Reservations held by the bound steps
    pub reservations: Vec<ResourceReservation>,

    /// Per-step rationales joined together
    pub placement_rationale: String,

    /// Sum of step costs
    pub expected_cost: f64,

    /// Critical path over step dependencies
    pub expected_latency_ms: f64,

    /// Weakest step privacy score
    pub privacy_score: f64,

    /// Mean step energy score
    pub energy_score: f64,

    /// Probability-style product of step reliability scores
    pub reliability_score: f64,

    /// Rebinding attempts per step id
    #[serde(default)]
    pub rebind_attempts: HashMap<String, u32>,

    /// Time spent taking reservations
    pub binding_latency_ms: f64,

    /// Last error recorded against the allocation
    #[serde(default)]
    pub last_error: Option<String>,

    /// Handle returned by the executor on dispatch
    #[serde(default)]
    pub execution_handle: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl ResourceAllocation {
    /// Build an allocation from freshly bound steps
    pub fn assemble(
        allocation_id: impl Into<String>,
        request: &AllocationRequest,
        status: AllocationStatus,
        bound_steps: Vec<BoundStep>,
        binding_latency_ms: f64,
    ) -> Self {
        let now = Utc::now();
        let mut allocation = Self {
            allocation_id: allocation_id.into(),
            plan_id: request.plan_id().to_string(),
            user_id: request.user_id.clone(),
            status,
            bound_steps: Vec::new(),
            reservations: Vec::new(),
            placement_rationale: String::new(),
            expected_cost: 0.0,
            expected_latency_ms: 0.0,
            privacy_score: 0.0,
            energy_score: 0.0,
            reliability_score: 0.0,
            rebind_attempts: HashMap::new(),
            binding_latency_ms,
            last_error: None,
            execution_handle: None,
            created_at: now,
            updated_at: now,
        };
        allocation.set_bound_steps(bound_steps);
        allocation
    }

    /// Copy of this allocation with one step's binding replaced.
    ///
    /// Returns `None` when the allocation has no step with that id.
    pub fn with_rebound_step(&self, bound: BoundStep) -> Option<ResourceAllocation> {
        let index = self
            .bound_steps
            .iter()
            .position(|b| b.step_id() == bound.step_id())?;

        let mut bound_steps = self.bound_steps.clone();
        bound_steps[index] = bound;

        let mut allocation = self.clone();
        allocation.set_bound_steps(bound_steps);
        allocation.updated_at = Utc::now();
        Some(allocation)
    }

    pub fn bound_step(&self, step_id: &str) -> Option<&BoundStep> {
        self.bound_steps.iter().find(|b| b.step_id() == step_id)
    }

    pub fn rebind_attempts_for(&self, step_id: &str) -> u32 {
        self.rebind_attempts.get(step_id).copied().unwrap_or(0)
    }

    pub fn total_rebinds(&self) -> u32 {
        self.rebind_attempts.values().sum()
    }

    pub fn reservation_ids(&self) -> Vec<String> {
        self.reservations.iter().map(|r| r.reservation_id.clone()).collect()
    }

    fn set_bound_steps(&mut self, bound_steps: Vec<BoundStep>) {
        let count = bound_steps.len();

        self.reservations = bound_steps.iter().map(|b| b.reservation.clone()).collect();
        self.placement_rationale = bound_steps
            .iter()
            .map(|b| b.placement.rationale.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        self.expected_cost = bound_steps.iter().map(|b| b.placement.expected_cost).sum();
        self.expected_latency_ms = critical_path_latency(&bound_steps);

        if count == 0 {
            self.privacy_score = 0.0;
            self.energy_score = 0.0;
            self.reliability_score = 0.0;
        } else {
            self.privacy_score = bound_steps
                .iter()
                .map(|b| b.placement.privacy_score)
                .fold(1.0, f64::min);
            self.energy_score =
                bound_steps.iter().map(|b| b.placement.energy_score).sum::<f64>() / count as f64;
            self.reliability_score = bound_steps
                .iter()
                .map(|b| b.placement.reliability_score)
                .product();
        }

        self.bound_steps = bound_steps;
    }
}

/// Longest chain of expected latencies through the dependency graph
fn critical_path_latency(bound_steps: &[BoundStep]) -> f64 {
    let steps: HashMap<&str, &BoundStep> = bound_steps.iter().map(|b| (b.step_id(), b)).collect();
    let mut memo = HashMap::new();
    let mut visiting = HashSet::new();

    bound_steps
        .iter()
        .map(|b| finish_time(b.step_id(), &steps, &mut memo, &mut visiting))
        .fold(0.0, f64::max)
}

fn finish_time<'a>(
    step_id: &'a str,
    steps: &HashMap<&'a str, &'a BoundStep>,
    memo: &mut HashMap<&'a str, f64>,
    visiting: &mut HashSet<&'a str>,
) -> f64 {
    if let Some(done) = memo.get(step_id) {
        return *done;
    }
    let bound: &'a BoundStep = match steps.get(step_id) {
        Some(bound) => *bound,
        None => return 0.0,
    };
    // cycles are the planner's problem; cut them instead of recursing forever
    if !visiting.insert(step_id) {
        return 0.0;
    }

    let start = bound
        .step
        .dependencies
        .iter()
        .map(|dep| finish_time(dep.as_str(), steps, memo, visiting))
        .fold(0.0, f64::max);
    visiting.remove(step_id);

    let finish = start + bound.placement.expected_latency_ms;
    memo.insert(step_id, finish);
    finish
}

/// Structured answer returned for every allocation operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationResponse {
    pub allocation_id: String,

    pub status: AllocationStatus,

    pub bound_steps: Vec<BoundStep>,

    pub placement_rationale: String,

    pub expected_cost: f64,

    pub expected_latency_ms: f64,

    pub privacy_score: f64,

    pub warnings: Vec<String>,

    pub errors: Vec<String>,
}

impl AllocationResponse {
    pub fn from_allocation(allocation: &ResourceAllocation, warnings: Vec<String>) -> Self {
        Self {
            allocation_id: allocation.allocation_id.clone(),
            status: allocation.status,
            bound_steps: allocation.bound_steps.clone(),
            placement_rationale: allocation.placement_rationale.clone(),
            expected_cost: allocation.expected_cost,
            expected_latency_ms: allocation.expected_latency_ms,
            privacy_score: allocation.privacy_score,
            warnings,
            errors: Vec::new(),
        }
    }

    /// Response carrying no bindings, only a status and the reasons for it
    pub fn rejected(
        allocation_id: impl Into<String>,
        status: AllocationStatus,
        errors: Vec<String>,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            allocation_id: allocation_id.into(),
            status,
            bound_steps: Vec::new(),
            placement_rationale: String::new(),
            expected_cost: 0.0,
            expected_latency_ms: 0.0,
            privacy_score: 0.0,
            warnings,
            errors,
        }
    }

    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors.extend(errors);
        self
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
            && !matches!(self.status, AllocationStatus::Failed | AllocationStatus::Cancelled)
    }
}

/// Why a step needs a new binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebindReason {
    ResourceOffline,
    ResourceDegraded,
    PerformanceDrift,
    ExecutionFailed,
    Manual,
}

impl fmt::Display for RebindReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            RebindReason::ResourceOffline => "resource_offline",
            RebindReason::ResourceDegraded => "resource_degraded",
            RebindReason::PerformanceDrift => "performance_drift",
            RebindReason::ExecutionFailed => "execution_failed",
            RebindReason::Manual => "manual",
        };
        f.write_str(reason)
    }
}

/// Failure or drift signal for one bound step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebindingRequest {
    pub allocation_id: String,

    pub step_id: String,

    pub reason: RebindReason,

    /// Resource the step is currently bound to
    pub current_resource_id: String,

    #[serde(default)]
    pub detail: Option<String>,
}

impl RebindingRequest {
    pub fn new(
        allocation_id: impl Into<String>,
        step_id: impl Into<String>,
        reason: RebindReason,
        current_resource_id: impl Into<String>,
    ) -> Self {
        Self {
            allocation_id: allocation_id.into(),
            step_id: step_id.into(),
            reason,
            current_resource_id: current_resource_id.into(),
            detail: None,
        }
    }
}
