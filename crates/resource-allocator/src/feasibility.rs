use crate::estimator::CostEstimator;
use crate::registry::ResourceRegistry;
use chrono::Utc;
use intentmesh_config::FeasibilityConfig;
use intentmesh_types::{
    ExecutionStep, FeasibilityResult, FeasibilityStatus, PowerState, Protocol, ResourceCapability,
    StepType,
};
use log::{debug, warn};
use std::collections::HashSet;
use std::sync::Arc;

/// Protocols a resource must offer (at least one of) to run a step type
pub fn required_protocols(step_type: StepType) -> &'static [Protocol] {
    match step_type {
        StepType::DeviceControl => &[
            Protocol::Zigbee,
            Protocol::ZWave,
            Protocol::Matter,
            Protocol::Thread,
            Protocol::Wifi,
            Protocol::Bluetooth,
        ],
        StepType::DataCollection => &[
            Protocol::Zigbee,
            Protocol::ZWave,
            Protocol::Matter,
            Protocol::Thread,
            Protocol::Wifi,
            Protocol::Bluetooth,
            Protocol::Mqtt,
            Protocol::Coap,
        ],
        StepType::MlInference | StepType::DataAnalysis => &[Protocol::Http, Protocol::Grpc],
        StepType::Notification => &[Protocol::Http, Protocol::Mqtt, Protocol::Wifi],
        StepType::StorageOperation => &[Protocol::Http, Protocol::Grpc, Protocol::Ethernet],
        StepType::Automation => &[
            Protocol::Http,
            Protocol::Mqtt,
            Protocol::Matter,
            Protocol::Zigbee,
        ],
    }
}

/// Hard requirements a resource must satisfy to be compatible with a step
#[derive(Debug, Clone)]
pub struct StepRequirements {
    /// Capability tag the resource must advertise
    pub capability: Option<String>,

    /// At least one of these protocols must be supported
    pub protocols: &'static [Protocol],

    /// Highest tolerated load fraction
    pub max_load: f64,
}

impl StepRequirements {
    pub fn for_step(step: &ExecutionStep, config: &FeasibilityConfig) -> Self {
        Self {
            capability: step.required_capability.clone(),
            protocols: required_protocols(step.step_type),
            max_load: config.max_load,
        }
    }

    /// Check if a resource meets every requirement
    pub fn matches(&self, resource: &ResourceCapability) -> bool {
        if resource.power_state != PowerState::Online {
            return false;
        }

        if resource.available_slots == 0 || resource.current_load > self.max_load {
            return false;
        }

        if let Some(capability) = &self.capability {
            if !resource.has_capability(capability) {
                return false;
            }
        }

        resource.supports_any(self.protocols)
    }
}

/// Determines which resources can run a step and how well
pub struct FeasibilityScanner {
    registry: Arc<dyn ResourceRegistry>,
    estimator: Arc<dyn CostEstimator>,
    config: FeasibilityConfig,
}

impl FeasibilityScanner {
    pub fn new(
        registry: Arc<dyn ResourceRegistry>,
        estimator: Arc<dyn CostEstimator>,
        config: FeasibilityConfig,
    ) -> Self {
        Self {
            registry,
            estimator,
            config,
        }
    }

    pub fn config(&self) -> &FeasibilityConfig {
        &self.config
    }

    /// Scan the registry for resources able to run `step`.
    ///
    /// Never fails: a registry error is reported as an `unknown` result.
    pub async fn check_feasibility(&self, step: &ExecutionStep) -> FeasibilityResult {
        self.check_feasibility_excluding(step, &HashSet::new()).await
    }

    /// Same as [`check_feasibility`](Self::check_feasibility) with some resources ruled out
    pub async fn check_feasibility_excluding(
        &self,
        step: &ExecutionStep,
        excluded: &HashSet<String>,
    ) -> FeasibilityResult {
        match self.registry.get_all_devices().await {
            Ok(resources) => self.evaluate(step, resources, excluded),
            Err(e) => {
                warn!("Feasibility scan for step {} failed: {}", step.step_id, e);
                FeasibilityResult::unknown(
                    &step.step_id,
                    format!("resource registry unavailable: {}", e),
                )
            }
        }
    }

    /// Evaluate a registry snapshot for one step
    pub fn evaluate(
        &self,
        step: &ExecutionStep,
        resources: Vec<ResourceCapability>,
        excluded: &HashSet<String>,
    ) -> FeasibilityResult {
        let requirements = StepRequirements::for_step(step, &self.config);
        let candidates: Vec<ResourceCapability> = resources
            .into_iter()
            .filter(|r| !excluded.contains(&r.resource_id))
            .filter(|r| requirements.matches(r))
            .collect();
        let compatible =
            self.rank_resources(candidates, requirements.protocols, step.target_device.as_deref());

        let estimate = self.estimator.estimate(step);
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(target) = &step.target_device {
            if !compatible.iter().any(|r| &r.resource_id == target) {
                warnings.push(format!(
                    "preferred resource {} cannot run step {}",
                    target, step.step_id
                ));
            }
        }

        let protocol_support = compatible.iter().any(|r| r.supports_any(requirements.protocols));
        let power_requirement_met = compatible.iter().any(|r| self.power_ok(r));
        let network_requirement_met = compatible.iter().any(|r| self.network_ok(r));

        let status = if compatible.is_empty() {
            errors.push(match &requirements.capability {
                Some(capability) => format!(
                    "no online resource with capability '{}' can run a {} step",
                    capability, step.step_type
                ),
                None => format!("no online resource can run a {} step", step.step_type),
            });
            FeasibilityStatus::Infeasible
        } else {
            if !protocol_support {
                errors.push(format!(
                    "no compatible resource speaks a protocol required for {}",
                    step.step_type
                ));
            }
            if !power_requirement_met {
                errors.push(format!(
                    "no compatible resource is mains powered or above {:.0}% battery",
                    self.config.min_battery_level * 100.0
                ));
            }
            if !network_requirement_met {
                errors.push(format!(
                    "no compatible resource has network quality >= {}, \
                     bandwidth >= {} Mbps and latency <= {} ms",
                    self.config.min_network_quality,
                    self.config.min_bandwidth_mbps,
                    self.config.max_latency_ms
                ));
            }

            if !errors.is_empty() {
                FeasibilityStatus::Infeasible
            } else if compatible.iter().any(|r| self.healthy(r)) {
                FeasibilityStatus::Feasible
            } else {
                warnings.push(format!(
                    "step {} can only run on degraded resources \
                     (none with network quality > {} and load < {})",
                    step.step_id, self.config.healthy_network_quality, self.config.healthy_max_load
                ));
                FeasibilityStatus::Degraded
            }
        };

        debug!(
            "Step {} is {} with {} compatible resources",
            step.step_id,
            status.as_str(),
            compatible.len()
        );

        FeasibilityResult {
            step_id: step.step_id.clone(),
            status,
            compatible_resources: compatible,
            estimated_energy_wh: estimate.energy_wh,
            estimated_time_ms: estimate.time_ms,
            protocol_support,
            power_requirement_met,
            network_requirement_met,
            warnings,
            errors,
            checked_at: Utc::now(),
        }
    }

    /// Weighted suitability of a resource for a set of required protocols
    pub fn suitability_score(&self, resource: &ResourceCapability, required: &[Protocol]) -> f64 {
        let w = &self.config.suitability;
        w.network_quality * resource.network_quality
            + w.load * (1.0 - resource.current_load)
            + w.cost * (1.0 / (1.0 + resource.cost_per_hour))
            + w.latency * (1.0 / (1.0 + resource.latency_ms / 100.0))
            + w.protocol * resource.protocol_match_fraction(required)
    }

    /// Order resources best first: pinned resource, then score, then resource id
    pub fn rank_resources(
        &self,
        resources: Vec<ResourceCapability>,
        required: &[Protocol],
        pinned: Option<&str>,
    ) -> Vec<ResourceCapability> {
        let mut scored: Vec<(f64, ResourceCapability)> = resources
            .into_iter()
            .map(|r| (self.suitability_score(&r, required), r))
            .collect();

        scored.sort_by(|(score_a, a), (score_b, b)| {
            let pinned_a = pinned == Some(a.resource_id.as_str());
            let pinned_b = pinned == Some(b.resource_id.as_str());
            pinned_b
                .cmp(&pinned_a)
                .then_with(|| score_b.total_cmp(score_a))
                .then_with(|| a.resource_id.cmp(&b.resource_id))
        });

        scored.into_iter().map(|(_, r)| r).collect()
    }

    fn power_ok(&self, resource: &ResourceCapability) -> bool {
        resource.is_mains_powered() || resource.battery_level > self.config.min_battery_level
    }

    fn network_ok(&self, resource: &ResourceCapability) -> bool {
        resource.network_quality >= self.config.min_network_quality
            && resource.bandwidth_mbps >= self.config.min_bandwidth_mbps
            && resource.latency_ms <= self.config.max_latency_ms
    }

    fn healthy(&self, resource: &ResourceCapability) -> bool {
        resource.network_quality > self.config.healthy_network_quality
            && resource.current_load < self.config.healthy_max_load
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::BaselineEstimator;
    use crate::registry::{InMemoryResourceRegistry, RegistryError};
    use async_trait::async_trait;
    use intentmesh_types::ResourceType;

    fn lamp(id: &str) -> ResourceCapability {
        ResourceCapability::new(id, ResourceType::Device)
            .with_capability("light")
            .with_protocols(&[Protocol::Zigbee])
            .with_network(0.9, 2.0, 20.0)
    }

    fn create_test_scanner(resources: Vec<ResourceCapability>) -> FeasibilityScanner {
        let registry = Arc::new(InMemoryResourceRegistry::from_resources(resources));
        FeasibilityScanner::new(registry, Arc::new(BaselineEstimator), FeasibilityConfig::default())
    }

    fn light_step() -> ExecutionStep {
        ExecutionStep::new("lights-on", StepType::DeviceControl).with_capability("light")
    }

    struct FailingRegistry;

    #[async_trait]
    impl ResourceRegistry for FailingRegistry {
        async fn get_all_devices(&self) -> Result<Vec<ResourceCapability>, RegistryError> {
            Err(RegistryError::Unavailable("connection refused".to_string()))
        }

        async fn get_device_capabilities(
            &self,
            _resource_id: &str,
        ) -> Result<Option<ResourceCapability>, RegistryError> {
            Err(RegistryError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_compatibility_filter() {
        let scanner = create_test_scanner(vec![
            lamp("lamp-ok"),
            lamp("lamp-offline").with_power_state(PowerState::Offline),
            lamp("lamp-busy").with_load(0.95),
            lamp("lamp-full").with_slots(0),
            ResourceCapability::new("lamp-grpc", ResourceType::Device)
                .with_capability("light")
                .with_protocols(&[Protocol::Grpc]),
            ResourceCapability::new("plug", ResourceType::Device)
                .with_capability("power")
                .with_protocols(&[Protocol::Zigbee]),
        ]);

        let result = scanner.check_feasibility(&light_step()).await;
        let ids: Vec<_> = result
            .compatible_resources
            .iter()
            .map(|r| r.resource_id.as_str())
            .collect();
        assert_eq!(ids, vec!["lamp-ok"]);
        assert_eq!(result.status, FeasibilityStatus::Feasible);
        assert!(result.protocol_support);
        assert!(result.power_requirement_met && result.network_requirement_met);
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn test_suitability_ranking_is_deterministic() {
        let resources = vec![
            lamp("lamp-c"),
            lamp("lamp-a"),
            lamp("lamp-b").with_load(0.3),
            lamp("lamp-d").with_network(1.0, 10.0, 5.0),
        ];
        let scanner = create_test_scanner(resources.clone());

        let expected = vec!["lamp-d", "lamp-a", "lamp-c", "lamp-b"];
        for _ in 0..5 {
            let mut shuffled = resources.clone();
            shuffled.reverse();
            let result = scanner.evaluate(&light_step(), shuffled, &HashSet::new());
            let ids: Vec<_> = result
                .compatible_resources
                .iter()
                .map(|r| r.resource_id.as_str())
                .collect();
            assert_eq!(ids, expected);
        }
    }

    #[test]
    fn test_suitability_score_weights() {
        let scanner = create_test_scanner(vec![]);
        let ideal = ResourceCapability::new("ideal", ResourceType::EdgeCompute)
            .with_protocols(&[Protocol::Http, Protocol::Grpc])
            .with_network(1.0, 100.0, 0.0);
        let score = scanner.suitability_score(&ideal, &[Protocol::Http, Protocol::Grpc]);
        assert!((score - 1.0).abs() < 1e-9);

        let pricey = ideal.clone().with_cost_per_hour(1.0);
        let score = scanner.suitability_score(&pricey, &[Protocol::Http, Protocol::Grpc]);
        assert!((score - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_degraded_when_no_healthy_resource() {
        let scanner = create_test_scanner(vec![lamp("lamp-1").with_load(0.7)]);
        let result = scanner.check_feasibility(&light_step()).await;
        assert_eq!(result.status, FeasibilityStatus::Degraded);
        assert_eq!(result.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_gates_make_step_infeasible() {
        let scanner = create_test_scanner(vec![lamp("lamp-1").with_battery_level(0.1)]);
        let result = scanner.check_feasibility(&light_step()).await;
        assert_eq!(result.status, FeasibilityStatus::Infeasible);
        assert!(!result.power_requirement_met);
        assert_eq!(result.compatible_resources.len(), 1);

        let scanner = create_test_scanner(vec![lamp("lamp-1").with_network(0.4, 2.0, 20.0)]);
        let result = scanner.check_feasibility(&light_step()).await;
        assert_eq!(result.status, FeasibilityStatus::Infeasible);
        assert!(!result.network_requirement_met);
    }

    #[tokio::test]
    async fn test_missing_capability_is_infeasible() {
        let cloud = ResourceCapability::new("cloud-1", ResourceType::CloudCompute)
            .with_protocols(&[Protocol::Http, Protocol::Grpc]);
        let scanner = create_test_scanner(vec![cloud]);
        let step =
            ExecutionStep::new("set-temp", StepType::DeviceControl).with_capability("thermostat");

        let result = scanner.check_feasibility(&step).await;
        assert_eq!(result.status, FeasibilityStatus::Infeasible);
        assert!(result.compatible_resources.is_empty());
        assert!(result.errors[0].contains("thermostat"));
    }

    #[tokio::test]
    async fn test_registry_failure_is_unknown() {
        let scanner = FeasibilityScanner::new(
            Arc::new(FailingRegistry),
            Arc::new(BaselineEstimator),
            FeasibilityConfig::default(),
        );
        let result = scanner.check_feasibility(&light_step()).await;
        assert_eq!(result.status, FeasibilityStatus::Unknown);
        assert!(result.errors[0].contains("connection refused"));
    }

    #[tokio::test]
    async fn test_exclusion_and_pinning() {
        let scanner = create_test_scanner(vec![lamp("lamp-a"), lamp("lamp-b").with_load(0.4)]);

        let pinned = light_step().with_target_device("lamp-b");
        let result = scanner.check_feasibility(&pinned).await;
        assert_eq!(result.compatible_resources[0].resource_id, "lamp-b");

        let excluded: HashSet<String> = ["lamp-a".to_string()].into_iter().collect();
        let result = scanner.check_feasibility_excluding(&light_step(), &excluded).await;
        assert_eq!(result.compatible_resources.len(), 1);
        assert_eq!(result.compatible_resources[0].resource_id, "lamp-b");
    }
}
