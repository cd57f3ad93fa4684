#![deny(unsafe_code)]
//! Allocator configuration.
//!
//! Every section and field has a default, so an empty TOML file (or no file at
//! all) yields the stock policy. Values are checked by [`AllocatorConfig::validate`]
//! when loaded through [`load_allocator_config`] or [`parse_allocator_config`].

use anyhow::{anyhow, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Weights of the resource suitability score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuitabilityWeights {
    #[serde(default = "default_weight_network_quality")]
    pub network_quality: f64,

    /// Applied to `1 - current_load`
    #[serde(default = "default_weight_load")]
    pub load: f64,

    /// Applied to `1 / (1 + cost_per_hour)`
    #[serde(default = "default_weight_cost")]
    pub cost: f64,

    /// Applied to `1 / (1 + latency_ms / 100)`
    #[serde(default = "default_weight_latency")]
    pub latency: f64,

    /// Applied to the protocol match fraction
    #[serde(default = "default_weight_protocol")]
    pub protocol: f64,
}

fn default_weight_network_quality() -> f64 {
    0.30
}

fn default_weight_load() -> f64 {
    0.25
}

fn default_weight_cost() -> f64 {
    0.20
}

fn default_weight_latency() -> f64 {
    0.15
}

fn default_weight_protocol() -> f64 {
    0.10
}

impl Default for SuitabilityWeights {
    fn default() -> Self {
        Self {
            network_quality: default_weight_network_quality(),
            load: default_weight_load(),
            cost: default_weight_cost(),
            latency: default_weight_latency(),
            protocol: default_weight_protocol(),
        }
    }
}

impl SuitabilityWeights {
    pub fn total(&self) -> f64 {
        self.network_quality + self.load + self.cost + self.latency + self.protocol
    }
}

/// Compatibility filter, gate thresholds and estimator settings for feasibility scans
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeasibilityConfig {
    /// Resources loaded above this fraction are not compatible
    #[serde(default = "default_max_load")]
    pub max_load: f64,

    /// Battery-powered resources need more than this level to pass the power gate
    #[serde(default = "default_min_battery_level")]
    pub min_battery_level: f64,

    #[serde(default = "default_min_network_quality")]
    pub min_network_quality: f64,

    #[serde(default = "default_min_bandwidth_mbps")]
    pub min_bandwidth_mbps: f64,

    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: f64,

    /// A step is feasible (not degraded) when some resource beats this quality...
    #[serde(default = "default_healthy_network_quality")]
    pub healthy_network_quality: f64,

    /// ...while staying under this load
    #[serde(default = "default_healthy_max_load")]
    pub healthy_max_load: f64,

    /// Relative jitter applied by the randomized estimator; 0 disables it
    #[serde(default)]
    pub estimate_jitter: f64,

    #[serde(default)]
    pub suitability: SuitabilityWeights,
}

fn default_max_load() -> f64 {
    0.9
}

fn default_min_battery_level() -> f64 {
    0.2
}

fn default_min_network_quality() -> f64 {
    0.5
}

fn default_min_bandwidth_mbps() -> f64 {
    1.0
}

fn default_max_latency_ms() -> f64 {
    1000.0
}

fn default_healthy_network_quality() -> f64 {
    0.8
}

fn default_healthy_max_load() -> f64 {
    0.5
}

impl Default for FeasibilityConfig {
    fn default() -> Self {
        Self {
            max_load: default_max_load(),
            min_battery_level: default_min_battery_level(),
            min_network_quality: default_min_network_quality(),
            min_bandwidth_mbps: default_min_bandwidth_mbps(),
            max_latency_ms: default_max_latency_ms(),
            healthy_network_quality: default_healthy_network_quality(),
            healthy_max_load: default_healthy_max_load(),
            estimate_jitter: 0.0,
            suitability: SuitabilityWeights::default(),
        }
    }
}

/// Strategy selection and fallback policy for placement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Upper bound on fallback resources kept per decision
    #[serde(default = "default_max_fallback_resources")]
    pub max_fallback_resources: usize,

    /// Cost budgets below this select the cost-optimized strategy
    #[serde(default = "default_low_cost_budget")]
    pub low_cost_budget: f64,

    /// Latency budgets below this select the latency-optimized strategy
    #[serde(default = "default_low_latency_budget_ms")]
    pub low_latency_budget_ms: f64,

    /// Place on any compatible resource when no allowed target has one
    #[serde(default = "default_true")]
    pub allow_out_of_policy_fallback: bool,
}

fn default_max_fallback_resources() -> usize {
    3
}

fn default_low_cost_budget() -> f64 {
    0.01
}

fn default_low_latency_budget_ms() -> f64 {
    100.0
}

fn default_true() -> bool {
    true
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            max_fallback_resources: default_max_fallback_resources(),
            low_cost_budget: default_low_cost_budget(),
            low_latency_budget_ms: default_low_latency_budget_ms(),
            allow_out_of_policy_fallback: default_true(),
        }
    }
}

/// Reservation windows and expiry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingConfig {
    /// Unconsumed reservations expire after this long
    #[serde(default = "default_reservation_timeout_secs")]
    pub reservation_timeout_secs: u64,

    /// Window length for steps without a duration estimate
    #[serde(default = "default_step_duration_ms")]
    pub default_step_duration_ms: u64,

    /// Period of the background expiry sweep
    #[serde(default = "default_expiry_sweep_interval_secs")]
    pub expiry_sweep_interval_secs: u64,
}

fn default_reservation_timeout_secs() -> u64 {
    30 * 60
}

fn default_step_duration_ms() -> u64 {
    60_000
}

fn default_expiry_sweep_interval_secs() -> u64 {
    60
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            reservation_timeout_secs: default_reservation_timeout_secs(),
            default_step_duration_ms: default_step_duration_ms(),
            expiry_sweep_interval_secs: default_expiry_sweep_interval_secs(),
        }
    }
}

impl BindingConfig {
    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_secs(self.reservation_timeout_secs)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_interval_secs)
    }
}

/// Limits on adaptive rebinding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebindingConfig {
    /// Rebinding attempts allowed per step
    #[serde(default = "default_max_rebind_attempts")]
    pub max_attempts: u32,

    /// Budget for one scan, place and bind round
    #[serde(default = "default_rebind_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_max_rebind_attempts() -> u32 {
    3
}

fn default_rebind_timeout_ms() -> u64 {
    30_000
}

impl Default for RebindingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_rebind_attempts(),
            timeout_ms: default_rebind_timeout_ms(),
        }
    }
}

impl RebindingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Executor handoff policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Release reservations when the executor rejects an allocation
    #[serde(default = "default_true")]
    pub release_on_failure: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            release_on_failure: default_true(),
        }
    }
}

/// Per-step budgets of each allocation phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTimeouts {
    #[serde(default = "default_feasibility_timeout_ms")]
    pub feasibility_ms: u64,

    #[serde(default = "default_placement_timeout_ms")]
    pub placement_ms: u64,

    #[serde(default = "default_binding_timeout_ms")]
    pub binding_ms: u64,
}

fn default_feasibility_timeout_ms() -> u64 {
    5_000
}

fn default_placement_timeout_ms() -> u64 {
    2_000
}

fn default_binding_timeout_ms() -> u64 {
    5_000
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            feasibility_ms: default_feasibility_timeout_ms(),
            placement_ms: default_placement_timeout_ms(),
            binding_ms: default_binding_timeout_ms(),
        }
    }
}

impl PhaseTimeouts {
    pub fn feasibility(&self) -> Duration {
        Duration::from_millis(self.feasibility_ms)
    }

    pub fn placement(&self) -> Duration {
        Duration::from_millis(self.placement_ms)
    }

    pub fn binding(&self) -> Duration {
        Duration::from_millis(self.binding_ms)
    }
}

/// Complete allocator configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocatorConfig {
    #[serde(default)]
    pub feasibility: FeasibilityConfig,

    #[serde(default)]
    pub placement: PlacementConfig,

    #[serde(default)]
    pub binding: BindingConfig,

    #[serde(default)]
    pub rebinding: RebindingConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub timeouts: PhaseTimeouts,
}

impl AllocatorConfig {
    /// Reject values the allocator cannot work with
    pub fn validate(&self) -> anyhow::Result<()> {
        let f = &self.feasibility;
        for (name, value) in [
            ("feasibility.max_load", f.max_load),
            ("feasibility.min_battery_level", f.min_battery_level),
            ("feasibility.min_network_quality", f.min_network_quality),
            ("feasibility.healthy_network_quality", f.healthy_network_quality),
            ("feasibility.healthy_max_load", f.healthy_max_load),
            ("feasibility.estimate_jitter", f.estimate_jitter),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{} must be within [0, 1], got {}", name, value);
            }
        }

        let total = f.suitability.total();
        if (total - 1.0).abs() > 1e-6 {
            bail!("feasibility.suitability weights must sum to 1.0, got {:.4}", total);
        }

        if self.rebinding.max_attempts == 0 {
            bail!("rebinding.max_attempts must be at least 1");
        }
        if self.binding.reservation_timeout_secs == 0 {
            bail!("binding.reservation_timeout_secs must be positive");
        }
        if self.binding.default_step_duration_ms == 0 {
            bail!("binding.default_step_duration_ms must be positive");
        }
        if self.binding.expiry_sweep_interval_secs == 0 {
            bail!("binding.expiry_sweep_interval_secs must be positive");
        }

        let t = &self.timeouts;
        if t.feasibility_ms == 0
            || t.placement_ms == 0
            || t.binding_ms == 0
            || self.rebinding.timeout_ms == 0
        {
            bail!("phase timeouts must be positive");
        }

        Ok(())
    }
}

/// Parse and validate a TOML configuration document
pub fn parse_allocator_config(content: &str) -> anyhow::Result<AllocatorConfig> {
    let config: AllocatorConfig = toml::from_str(content)
        .map_err(|e| anyhow!("Failed to parse allocator config: {}", e))?;
    config.validate()?;
    Ok(config)
}

/// Load and validate a TOML configuration file
pub fn load_allocator_config(path: impl AsRef<Path>) -> anyhow::Result<AllocatorConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("Failed to read config file from {}: {}", path.display(), e))?;
    parse_allocator_config(&content)
        .map_err(|e| anyhow!("Invalid config file {}: {}", path.display(), e))
}
