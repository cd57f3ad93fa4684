use crate::error::{AllocationError, AllocationResult};
use chrono::Utc;
use intentmesh_config::PlacementConfig;
use intentmesh_types::{
    AllocationRequest, ExecutionStep, FeasibilityResult, PlacementDecision, PlacementStrategy,
    PlacementTarget, PrivacyClass, ResourceCapability, StepType,
};
use log::{debug, warn};

/// Weight vector over the five placement objectives; sums to 1.0
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyWeights {
    pub privacy: f64,
    pub cost: f64,
    pub latency: f64,
    pub energy: f64,
    pub reliability: f64,
}

impl StrategyWeights {
    pub fn for_strategy(strategy: PlacementStrategy) -> Self {
        let (privacy, cost, latency, energy, reliability) = match strategy {
            PlacementStrategy::PrivacyFirst => (0.50, 0.10, 0.10, 0.10, 0.20),
            PlacementStrategy::CostOptimized => (0.10, 0.50, 0.10, 0.15, 0.15),
            PlacementStrategy::LatencyOptimized => (0.10, 0.10, 0.50, 0.10, 0.20),
            PlacementStrategy::EnergyEfficient => (0.15, 0.15, 0.10, 0.45, 0.15),
            PlacementStrategy::Balanced => (0.20, 0.20, 0.20, 0.20, 0.20),
        };
        Self {
            privacy,
            cost,
            latency,
            energy,
            reliability,
        }
    }
}

/// Fixed characteristics of a placement target
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetProfile {
    pub privacy: f64,
    /// Higher is cheaper
    pub cost: f64,
    /// Higher is faster
    pub latency: f64,
    pub energy: f64,
    pub reliability: f64,
    /// Base cost per execution in dollars
    pub base_cost: f64,
    /// Base response latency in milliseconds
    pub base_latency_ms: f64,
}

pub fn target_profile(target: PlacementTarget) -> TargetProfile {
    let (privacy, cost, latency, energy, reliability, base_cost, base_latency_ms) = match target {
        PlacementTarget::LocalDevice => (1.00, 0.90, 0.95, 0.70, 0.70, 0.0001, 5.0),
        PlacementTarget::EdgeGateway => (0.80, 0.80, 0.85, 0.80, 0.80, 0.0005, 15.0),
        PlacementTarget::EdgeCluster => (0.60, 0.60, 0.70, 0.60, 0.85, 0.002, 40.0),
        PlacementTarget::CloudRegion => (0.30, 0.40, 0.40, 0.50, 0.95, 0.01, 120.0),
        PlacementTarget::Hybrid => (0.50, 0.60, 0.60, 0.60, 0.90, 0.005, 60.0),
    };
    TargetProfile {
        privacy,
        cost,
        latency,
        energy,
        reliability,
        base_cost,
        base_latency_ms,
    }
}

/// Targets a privacy class may be placed on
pub fn privacy_allowed_targets(class: PrivacyClass) -> &'static [PlacementTarget] {
    match class {
        PrivacyClass::Restricted => &[PlacementTarget::LocalDevice],
        PrivacyClass::Confidential => &[PlacementTarget::LocalDevice, PlacementTarget::EdgeGateway],
        PrivacyClass::Internal => &[
            PlacementTarget::LocalDevice,
            PlacementTarget::EdgeGateway,
            PlacementTarget::EdgeCluster,
        ],
        PrivacyClass::Public => &PlacementTarget::SCORED,
    }
}

/// Targets able to run a step type
pub fn step_allowed_targets(step_type: StepType) -> &'static [PlacementTarget] {
    match step_type {
        StepType::DeviceControl => &[PlacementTarget::LocalDevice, PlacementTarget::EdgeGateway],
        StepType::DataCollection | StepType::Automation => &[
            PlacementTarget::LocalDevice,
            PlacementTarget::EdgeGateway,
            PlacementTarget::EdgeCluster,
        ],
        StepType::MlInference | StepType::DataAnalysis | StepType::StorageOperation => &[
            PlacementTarget::EdgeGateway,
            PlacementTarget::EdgeCluster,
            PlacementTarget::CloudRegion,
        ],
        StepType::Notification => &PlacementTarget::SCORED,
    }
}

/// Intersection of the privacy and step-type tables, in target order
pub fn allowed_targets(class: PrivacyClass, step_type: StepType) -> Vec<PlacementTarget> {
    let by_privacy = privacy_allowed_targets(class);
    step_allowed_targets(step_type)
        .iter()
        .copied()
        .filter(|t| by_privacy.contains(t))
        .collect()
}

/// Privacy class assumed for steps nobody classified
pub fn default_privacy_class(step_type: StepType) -> PrivacyClass {
    match step_type {
        StepType::DeviceControl | StepType::DataCollection | StepType::Automation => {
            PrivacyClass::Confidential
        }
        StepType::MlInference
        | StepType::DataAnalysis
        | StepType::StorageOperation
        | StepType::Notification => PrivacyClass::Internal,
    }
}

/// Step class, else the request's per-step or plan-wide class, else the step-type default
pub fn resolve_privacy_class(step: &ExecutionStep, request: &AllocationRequest) -> PrivacyClass {
    let requirements = &request.privacy_requirements;
    step.privacy_class
        .or_else(|| requirements.step_classes.get(&step.step_id).copied())
        .or(requirements.data_class)
        .unwrap_or_else(|| default_privacy_class(step.step_type))
}

/// Compute and latency overhead of a step type: (dollars, milliseconds)
fn step_overhead(step_type: StepType) -> (f64, f64) {
    match step_type {
        StepType::MlInference => (0.002, 100.0),
        StepType::DataAnalysis => (0.001, 50.0),
        StepType::StorageOperation => (0.0005, 20.0),
        _ => (0.0, 0.0),
    }
}

#[derive(Debug, Clone, Copy)]
struct ScoreCard {
    expected_cost: f64,
    expected_latency_ms: f64,
    privacy: f64,
    energy: f64,
    reliability: f64,
}

impl ScoreCard {
    fn is_finite(&self) -> bool {
        [
            self.expected_cost,
            self.expected_latency_ms,
            self.privacy,
            self.energy,
            self.reliability,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

/// Chooses where each step runs
pub struct PlacementDecider {
    config: PlacementConfig,
}

impl PlacementDecider {
    pub fn new(config: PlacementConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    /// First matching rule wins
    pub fn select_strategy(&self, request: &AllocationRequest) -> PlacementStrategy {
        if request.privacy_requirements.privacy_first {
            PlacementStrategy::PrivacyFirst
        } else if request
            .cost_budget
            .map_or(false, |budget| budget < self.config.low_cost_budget)
        {
            PlacementStrategy::CostOptimized
        } else if request
            .latency_budget_ms
            .map_or(false, |budget| budget < self.config.low_latency_budget_ms)
        {
            PlacementStrategy::LatencyOptimized
        } else if request.energy_constraints.energy_efficient {
            PlacementStrategy::EnergyEfficient
        } else {
            PlacementStrategy::Balanced
        }
    }

    /// Weighted score of a target under a strategy
    pub fn score_target(target: PlacementTarget, weights: &StrategyWeights) -> f64 {
        let profile = target_profile(target);
        weights.privacy * profile.privacy
            + weights.cost * profile.cost
            + weights.latency * profile.latency
            + weights.energy * profile.energy
            + weights.reliability * profile.reliability
    }

    /// Targets best first; equal scores keep target order
    pub fn rank_targets(
        allowed: &[PlacementTarget],
        weights: &StrategyWeights,
    ) -> Vec<(PlacementTarget, f64)> {
        let mut ranked: Vec<(PlacementTarget, f64)> = allowed
            .iter()
            .map(|t| (*t, Self::score_target(*t, weights)))
            .collect();
        ranked.sort_by(|(ta, a), (tb, b)| b.total_cmp(a).then_with(|| ta.cmp(tb)));
        ranked
    }

    /// Place one feasible step.
    ///
    /// Errors only when there is nothing to place on; scoring problems
    /// degrade to a best-effort decision on the top compatible resource.
    pub fn decide_placement(
        &self,
        step: &ExecutionStep,
        feasibility: &FeasibilityResult,
        request: &AllocationRequest,
    ) -> AllocationResult<PlacementDecision> {
        let best = feasibility.best_resource().ok_or_else(|| {
            AllocationError::infeasible(&step.step_id, "no compatible resources to place on")
        })?;

        let privacy_class = resolve_privacy_class(step, request);
        let allowed = allowed_targets(privacy_class, step.step_type);
        let strategy = self.select_strategy(request);
        let weights = StrategyWeights::for_strategy(strategy);
        let ranked = Self::rank_targets(&allowed, &weights);

        let mut warnings = Vec::new();
        let (target, primary, in_policy) = match choose_primary(&ranked, feasibility) {
            Some((target, primary)) => (target, primary, true),
            None if self.config.allow_out_of_policy_fallback => {
                let target = PlacementTarget::for_resource_type(best.resource_type);
                warn!(
                    "Step {} has no resource on a target allowed for {} data; using {} on {}",
                    step.step_id, privacy_class, best.resource_id, target
                );
                warnings.push(format!(
                    "no compatible resource on a target allowed for {} data; placed on {} ({})",
                    privacy_class, best.resource_id, target
                ));
                (target, best, false)
            }
            None => {
                return Err(AllocationError::infeasible(
                    &step.step_id,
                    format!(
                        "no compatible resource on a target allowed for {} {} steps",
                        privacy_class, step.step_type
                    ),
                ))
            }
        };

        let card = score_card(step, target, primary, feasibility.estimated_time_ms);
        if !card.is_finite() {
            let error = format!("non-finite score for resource {}", primary.resource_id);
            warn!("Placement scoring for step {} failed: {}", step.step_id, error);
            return Ok(self.best_effort(step, feasibility, privacy_class, &error));
        }

        let mut fallback_resources: Vec<ResourceCapability> = feasibility
            .compatible_resources
            .iter()
            .filter(|r| r.resource_id != primary.resource_id)
            .filter(|r| !in_policy || allowed.iter().any(|t| t.accepts(r.resource_type)))
            .cloned()
            .collect();
        fallback_resources.truncate(self.config.max_fallback_resources);

        let placement_score = Self::score_target(target, &weights);
        let rationale = describe(step, target, primary, strategy, &card, placement_score);
        debug!("{}", rationale);

        Ok(PlacementDecision {
            step_id: step.step_id.clone(),
            target,
            strategy,
            privacy_class,
            primary_resource: primary.clone(),
            fallback_resources,
            rationale,
            expected_cost: card.expected_cost,
            expected_latency_ms: card.expected_latency_ms,
            estimated_energy_wh: feasibility.estimated_energy_wh,
            estimated_time_ms: feasibility.estimated_time_ms,
            privacy_score: card.privacy,
            energy_score: card.energy,
            reliability_score: card.reliability,
            placement_score,
            warnings,
            decided_at: Utc::now(),
        })
    }

    fn best_effort(
        &self,
        step: &ExecutionStep,
        feasibility: &FeasibilityResult,
        privacy_class: PrivacyClass,
        error: &str,
    ) -> PlacementDecision {
        let primary = feasibility.compatible_resources[0].clone();
        let target = PlacementTarget::for_resource_type(primary.resource_type);
        let profile = target_profile(target);
        let card = score_card(step, target, &primary, feasibility.estimated_time_ms);
        let finite_or =
            |value: f64, fallback: f64| if value.is_finite() { value } else { fallback };
        let placement_score =
            Self::score_target(target, &StrategyWeights::for_strategy(PlacementStrategy::Balanced));

        let fallback_resources = feasibility
            .compatible_resources
            .iter()
            .skip(1)
            .take(self.config.max_fallback_resources)
            .cloned()
            .collect();

        PlacementDecision {
            step_id: step.step_id.clone(),
            target,
            strategy: PlacementStrategy::Balanced,
            privacy_class,
            rationale: format!(
                "step {} -> {} on {} via best-effort balanced placement after scoring error \
                 ({}): privacy {:.2}, energy {:.2}, reliability {:.2}, score {:.2}",
                step.step_id,
                target,
                primary.resource_id,
                error,
                profile.privacy,
                profile.energy,
                profile.reliability,
                placement_score
            ),
            primary_resource: primary,
            fallback_resources,
            expected_cost: finite_or(card.expected_cost, profile.base_cost),
            expected_latency_ms: finite_or(card.expected_latency_ms, profile.base_latency_ms),
            estimated_energy_wh: finite_or(feasibility.estimated_energy_wh, 0.0),
            estimated_time_ms: finite_or(feasibility.estimated_time_ms, 0.0),
            privacy_score: profile.privacy,
            energy_score: profile.energy,
            reliability_score: profile.reliability,
            placement_score,
            warnings: vec![format!("best-effort placement: {}", error)],
            decided_at: Utc::now(),
        }
    }
}

/// Move a decision onto one of its fallback resources.
///
/// Strategy and privacy class are kept. The target is the best-ranked allowed
/// target that accepts the resource, and every score is recomputed for it.
pub fn rebase_decision(
    step: &ExecutionStep,
    decision: &PlacementDecision,
    resource: &ResourceCapability,
    note: &str,
) -> PlacementDecision {
    let weights = StrategyWeights::for_strategy(decision.strategy);
    let allowed = allowed_targets(decision.privacy_class, step.step_type);
    let target = PlacementDecider::rank_targets(&allowed, &weights)
        .into_iter()
        .map(|(target, _)| target)
        .find(|target| target.accepts(resource.resource_type))
        .unwrap_or_else(|| PlacementTarget::for_resource_type(resource.resource_type));

    let profile = target_profile(target);
    let mut card = score_card(step, target, resource, decision.estimated_time_ms);
    if !card.is_finite() {
        card = ScoreCard {
            expected_cost: profile.base_cost,
            expected_latency_ms: profile.base_latency_ms,
            privacy: profile.privacy,
            energy: profile.energy,
            reliability: profile.reliability,
        };
    }
    let placement_score = PlacementDecider::score_target(target, &weights);

    let fallback_resources = decision
        .fallback_resources
        .iter()
        .filter(|r| r.resource_id != resource.resource_id)
        .cloned()
        .collect();

    PlacementDecision {
        step_id: decision.step_id.clone(),
        target,
        strategy: decision.strategy,
        privacy_class: decision.privacy_class,
        primary_resource: resource.clone(),
        fallback_resources,
        rationale: format!(
            "{} [{}]",
            describe(step, target, resource, decision.strategy, &card, placement_score),
            note
        ),
        expected_cost: card.expected_cost,
        expected_latency_ms: card.expected_latency_ms,
        estimated_energy_wh: decision.estimated_energy_wh,
        estimated_time_ms: decision.estimated_time_ms,
        privacy_score: card.privacy,
        energy_score: card.energy,
        reliability_score: card.reliability,
        placement_score,
        warnings: decision.warnings.clone(),
        decided_at: Utc::now(),
    }
}

fn describe(
    step: &ExecutionStep,
    target: PlacementTarget,
    resource: &ResourceCapability,
    strategy: PlacementStrategy,
    card: &ScoreCard,
    placement_score: f64,
) -> String {
    format!(
        "step {} -> {} on {} via {} strategy: privacy {:.2}, energy {:.2}, \
         reliability {:.2}, score {:.2} (expected cost ${:.4}, latency {:.0}ms)",
        step.step_id,
        target,
        resource.resource_id,
        strategy,
        card.privacy,
        card.energy,
        card.reliability,
        placement_score,
        card.expected_cost,
        card.expected_latency_ms
    )
}

/// Top-ranked target with a compatible resource, and that resource
fn choose_primary<'a>(
    ranked: &[(PlacementTarget, f64)],
    feasibility: &'a FeasibilityResult,
) -> Option<(PlacementTarget, &'a ResourceCapability)> {
    ranked.iter().find_map(|(target, _)| {
        feasibility
            .compatible_resources
            .iter()
            .find(|r| target.accepts(r.resource_type))
            .map(|r| (*target, r))
    })
}

fn score_card(
    step: &ExecutionStep,
    target: PlacementTarget,
    resource: &ResourceCapability,
    estimated_time_ms: f64,
) -> ScoreCard {
    let profile = target_profile(target);
    let (cost_overhead, latency_overhead) = step_overhead(step.step_type);
    let hours = estimated_time_ms / 3_600_000.0;

    let mut energy = profile.energy;
    if !resource.is_mains_powered() {
        energy *= 0.5 + 0.5 * resource.battery_level;
    }
    let reliability = 0.6 * profile.reliability
        + 0.25 * resource.network_quality
        + 0.15 * (1.0 - resource.current_load);

    ScoreCard {
        expected_cost: profile.base_cost
            + resource.cost_per_hour * hours
            + cost_overhead
            + step.estimated_cost,
        expected_latency_ms: profile.base_latency_ms + resource.latency_ms + latency_overhead,
        privacy: profile.privacy,
        energy: energy.clamp(0.0, 1.0),
        reliability: reliability.clamp(0.0, 1.0),
    }
}
