use intentmesh_types::{ExecutionStep, StepType};
use rand::Rng;

/// Energy and time estimate for one step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostEstimate {
    pub energy_wh: f64,
    pub time_ms: f64,
}

/// Min/max/average of an estimated quantity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimateRange {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl EstimateRange {
    const fn new(min: f64, max: f64, avg: f64) -> Self {
        Self { min, max, avg }
    }

    fn clamp(&self, value: f64) -> f64 {
        value.max(self.min).min(self.max)
    }
}

/// Base distribution of energy and time for a step type
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimateProfile {
    pub energy_wh: EstimateRange,
    pub time_ms: EstimateRange,
}

/// Default per-step-type profiles
pub fn base_profile(step_type: StepType) -> EstimateProfile {
    let (energy_wh, time_ms) = match step_type {
        StepType::DeviceControl => (
            EstimateRange::new(0.05, 0.5, 0.1),
            EstimateRange::new(100.0, 3_000.0, 500.0),
        ),
        StepType::DataCollection => (
            EstimateRange::new(0.1, 2.0, 0.5),
            EstimateRange::new(500.0, 10_000.0, 2_000.0),
        ),
        StepType::MlInference => (
            EstimateRange::new(1.0, 20.0, 5.0),
            EstimateRange::new(200.0, 5_000.0, 1_000.0),
        ),
        StepType::Notification => (
            EstimateRange::new(0.01, 0.1, 0.02),
            EstimateRange::new(50.0, 1_000.0, 200.0),
        ),
        StepType::DataAnalysis => (
            EstimateRange::new(0.5, 10.0, 2.0),
            EstimateRange::new(1_000.0, 30_000.0, 5_000.0),
        ),
        StepType::StorageOperation => (
            EstimateRange::new(0.05, 1.0, 0.2),
            EstimateRange::new(100.0, 5_000.0, 800.0),
        ),
        StepType::Automation => (
            EstimateRange::new(0.1, 1.0, 0.3),
            EstimateRange::new(200.0, 5_000.0, 1_000.0),
        ),
    };
    EstimateProfile { energy_wh, time_ms }
}

/// Source of energy/time estimates for feasibility scans.
///
/// Stands in for a real measurement feed; swap implementations without
/// touching the scanner.
pub trait CostEstimator: Send + Sync {
    fn estimate(&self, step: &ExecutionStep) -> CostEstimate;
}

/// Deterministic estimator returning profile averages.
///
/// A planner-supplied duration overrides the time average.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaselineEstimator;

impl CostEstimator for BaselineEstimator {
    fn estimate(&self, step: &ExecutionStep) -> CostEstimate {
        let profile = base_profile(step.step_type);
        let time_ms = if step.estimated_duration_ms > 0 {
            step.estimated_duration_ms as f64
        } else {
            profile.time_ms.avg
        };
        CostEstimate {
            energy_wh: profile.energy_wh.avg,
            time_ms,
        }
    }
}

/// Estimator that spreads profile averages by a relative jitter, clamped to the profile range
#[derive(Debug, Clone, Copy)]
pub struct JitterEstimator {
    jitter: f64,
}

impl JitterEstimator {
    /// `jitter` is a fraction, e.g. 0.25 for ±25%
    pub fn new(jitter: f64) -> Self {
        Self {
            jitter: jitter.abs().min(1.0),
        }
    }
}

impl CostEstimator for JitterEstimator {
    fn estimate(&self, step: &ExecutionStep) -> CostEstimate {
        let profile = base_profile(step.step_type);
        let mut rng = rand::thread_rng();
        let mut spread = |range: &EstimateRange| {
            let factor = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
            range.clamp(range.avg * factor)
        };

        CostEstimate {
            energy_wh: spread(&profile.energy_wh),
            time_ms: spread(&profile.time_ms),
        }
    }
}
