use crate::placement::PlacementDecision;
use crate::plan::ExecutionStep;
use crate::reservation::ResourceReservation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do with a field before data leaves the step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedactionAction {
    Drop,
    Hash,
    Mask,
    Aggregate,
}

/// Field-level data-minimization rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimizationRule {
    pub field: String,
    pub action: RedactionAction,
}

impl MinimizationRule {
    pub fn new(field: impl Into<String>, action: RedactionAction) -> Self {
        Self {
            field: field.into(),
            action,
        }
    }
}

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_backoff_ms: u64,

    /// Growth factor between retries
    pub backoff_multiplier: f64,

    /// Upper bound on any single delay
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based)
    pub fn backoff_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = self.backoff_multiplier.powi(retry.saturating_sub(1) as i32);
        let delay_ms = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Run-time configuration attached to a bound step before dispatch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfiguration {
    /// Consent scope the executor must hold before running the step
    pub consent_scope: Option<String>,

    /// Field redaction rules
    pub data_minimization: Vec<MinimizationRule>,

    pub retry_policy: RetryPolicy,

    /// Hook identifiers to run if the step has to be undone
    pub rollback_hooks: Vec<String>,
}

/// A step bound to a reservation. Replaced, never edited, on rebinding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundStep {
    /// The plan step
    pub step: ExecutionStep,

    /// Placement the binding honours
    pub placement: PlacementDecision,

    /// Reservation held on the placement's primary resource
    pub reservation: ResourceReservation,

    /// Run-time configuration
    #[serde(default)]
    pub run_config: RunConfiguration,

    /// The planned primary was taken and a fallback was bound instead
    #[serde(default)]
    pub used_fallback: bool,

    /// Binding attempt, 1 for the initial allocation
    pub attempt: u32,

    pub bound_at: DateTime<Utc>,
}

impl BoundStep {
    pub fn step_id(&self) -> &str {
        &self.step.step_id
    }

    pub fn resource_id(&self) -> &str {
        &self.reservation.resource_id
    }

    /// Same binding with a new run configuration
    pub fn with_run_config(self, run_config: RunConfiguration) -> Self {
        BoundStep { run_config, ..self }
    }
}
