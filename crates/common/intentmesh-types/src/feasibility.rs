use crate::capability::ResourceCapability;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a feasibility scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeasibilityStatus {
    /// At least one healthy, lightly loaded resource can run the step
    Feasible,
    /// Compatible resources exist but none is in good shape
    Degraded,
    /// No resource can run the step
    Infeasible,
    /// The scan itself failed
    Unknown,
}

impl FeasibilityStatus {
    /// Whether the allocator may go on to place the step
    pub fn is_allocatable(&self) -> bool {
        matches!(self, FeasibilityStatus::Feasible | FeasibilityStatus::Degraded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeasibilityStatus::Feasible => "feasible",
            FeasibilityStatus::Degraded => "degraded",
            FeasibilityStatus::Infeasible => "infeasible",
            FeasibilityStatus::Unknown => "unknown",
        }
    }
}

/// Scan output for one step. Produced fresh per allocation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeasibilityResult {
    /// Step the scan was run for
    pub step_id: String,

    /// Overall verdict
    pub status: FeasibilityStatus,

    /// Compatible resources, best first
    pub compatible_resources: Vec<ResourceCapability>,

    /// Estimated energy use in watt-hours
    pub estimated_energy_wh: f64,

    /// Estimated run time in milliseconds
    pub estimated_time_ms: f64,

    /// Some compatible resource speaks a required protocol
    pub protocol_support: bool,

    /// Some compatible resource has enough power
    pub power_requirement_met: bool,

    /// Some compatible resource has a usable network link
    pub network_requirement_met: bool,

    pub warnings: Vec<String>,

    pub errors: Vec<String>,

    /// When the scan ran
    pub checked_at: DateTime<Utc>,
}

impl FeasibilityResult {
    /// Result for a scan that could not complete
    pub fn unknown(step_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: FeasibilityStatus::Unknown,
            compatible_resources: Vec::new(),
            estimated_energy_wh: 0.0,
            estimated_time_ms: 0.0,
            protocol_support: false,
            power_requirement_met: false,
            network_requirement_met: false,
            warnings: Vec::new(),
            errors: vec![error.into()],
            checked_at: Utc::now(),
        }
    }

    /// Best ranked compatible resource
    pub fn best_resource(&self) -> Option<&ResourceCapability> {
        self.compatible_resources.first()
    }

    pub fn is_compatible(&self, resource_id: &str) -> bool {
        self.compatible_resources.iter().any(|r| r.resource_id == resource_id)
    }
}
