use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Derived, read-only quality snapshot of one allocation.
///
/// Always recomputed from the current allocation; never updated field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationMetrics {
    pub allocation_id: String,

    /// Share of steps bound to their planned primary resource
    pub placement_accuracy: f64,

    /// Rebinding attempts per step
    pub rebinding_rate: f64,

    /// Share of steps placed on local devices
    pub local_execution_ratio: f64,

    /// Mean load of the bound resources
    pub device_utilization: f64,

    /// Time spent taking reservations
    pub binding_latency_ms: f64,

    /// Population variance of per-step expected cost
    pub cost_variance: f64,

    /// Population variance of per-step expected latency
    pub latency_variance: f64,

    /// Share of steps placed on a target their privacy class allows
    pub privacy_compliance: f64,

    /// How well the plan fits the request's energy budget, in [0, 1]
    pub energy_compliance: f64,

    pub computed_at: DateTime<Utc>,
}
