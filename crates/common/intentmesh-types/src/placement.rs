use crate::capability::{ResourceCapability, ResourceType};
use crate::plan::PrivacyClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution locale for a step. Declaration order is the scoring tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementTarget {
    LocalDevice,
    EdgeGateway,
    EdgeCluster,
    CloudRegion,
    Hybrid,
}

impl PlacementTarget {
    /// Targets that take part in scoring
    pub const SCORED: [PlacementTarget; 4] = [
        PlacementTarget::LocalDevice,
        PlacementTarget::EdgeGateway,
        PlacementTarget::EdgeCluster,
        PlacementTarget::CloudRegion,
    ];

    /// Whether a resource of the given type may serve this target
    pub fn accepts(&self, resource_type: ResourceType) -> bool {
        match self {
            PlacementTarget::LocalDevice => resource_type.is_local_hardware(),
            PlacementTarget::EdgeGateway => {
                matches!(resource_type, ResourceType::EdgeCompute | ResourceType::Network)
            }
            PlacementTarget::EdgeCluster => {
                matches!(resource_type, ResourceType::EdgeCompute | ResourceType::Storage)
            }
            PlacementTarget::CloudRegion => {
                matches!(resource_type, ResourceType::CloudCompute | ResourceType::Storage)
            }
            PlacementTarget::Hybrid => true,
        }
    }

    /// Infer the natural target of a resource from its type
    pub fn for_resource_type(resource_type: ResourceType) -> PlacementTarget {
        match resource_type {
            ResourceType::Device | ResourceType::Sensor | ResourceType::Actuator => {
                PlacementTarget::LocalDevice
            }
            ResourceType::EdgeCompute | ResourceType::Network => PlacementTarget::EdgeGateway,
            ResourceType::Storage => PlacementTarget::EdgeCluster,
            ResourceType::CloudCompute => PlacementTarget::CloudRegion,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlacementTarget::LocalDevice => "local_device",
            PlacementTarget::EdgeGateway => "edge_gateway",
            PlacementTarget::EdgeCluster => "edge_cluster",
            PlacementTarget::CloudRegion => "cloud_region",
            PlacementTarget::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for PlacementTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Weighting policy used to score placement targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStrategy {
    PrivacyFirst,
    CostOptimized,
    LatencyOptimized,
    EnergyEfficient,
    Balanced,
}

impl PlacementStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlacementStrategy::PrivacyFirst => "privacy_first",
            PlacementStrategy::CostOptimized => "cost_optimized",
            PlacementStrategy::LatencyOptimized => "latency_optimized",
            PlacementStrategy::EnergyEfficient => "energy_efficient",
            PlacementStrategy::Balanced => "balanced",
        }
    }
}

impl fmt::Display for PlacementStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Placement of one step: where it runs and on which resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementDecision {
    /// Step being placed
    pub step_id: String,

    /// Chosen execution locale
    pub target: PlacementTarget,

    /// Strategy the target was scored with
    pub strategy: PlacementStrategy,

    /// Privacy class the decision was made under
    pub privacy_class: PrivacyClass,

    /// Resource the step is bound to first
    pub primary_resource: ResourceCapability,

    /// Alternatives in suitability order, primary excluded
    pub fallback_resources: Vec<ResourceCapability>,

    /// Human-readable explanation of the decision
    pub rationale: String,

    /// Estimated cost in dollars (not a billed amount)
    pub expected_cost: f64,

    /// Estimated response latency in milliseconds
    pub expected_latency_ms: f64,

    /// Estimated energy use in watt-hours
    pub estimated_energy_wh: f64,

    /// Estimated run time the cost was computed from
    #[serde(default)]
    pub estimated_time_ms: f64,

    pub privacy_score: f64,

    pub energy_score: f64,

    pub reliability_score: f64,

    /// Weighted strategy score of the chosen target
    pub placement_score: f64,

    #[serde(default)]
    pub warnings: Vec<String>,

    pub decided_at: DateTime<Utc>,
}
