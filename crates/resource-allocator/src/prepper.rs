use crate::placement::resolve_privacy_class;
use intentmesh_types::{
    AllocationRequest, BoundStep, MinimizationRule, PrivacyClass, RedactionAction, RetryPolicy,
    RunConfiguration, StepType,
};

/// Consent scope a step runs under
pub fn consent_scope(
    class: PrivacyClass,
    user_id: &str,
    step_type: StepType,
    step_id: &str,
) -> Option<String> {
    let scope = match class {
        PrivacyClass::Public => "public".to_string(),
        PrivacyClass::Internal => format!("internal:household:{}", user_id),
        PrivacyClass::Confidential => format!("confidential:user:{}:{}", user_id, step_type),
        PrivacyClass::Restricted => format!("restricted:explicit:{}:{}", user_id, step_id),
    };
    Some(scope)
}

/// Redactions applied to step inputs, cumulative with privacy class
pub fn minimization_rules(class: PrivacyClass) -> Vec<MinimizationRule> {
    let mut rules = Vec::new();
    if class >= PrivacyClass::Internal {
        rules.push(MinimizationRule::new("user_id", RedactionAction::Hash));
    }
    if class >= PrivacyClass::Confidential {
        rules.push(MinimizationRule::new("location", RedactionAction::Drop));
        rules.push(MinimizationRule::new("device_id", RedactionAction::Mask));
    }
    if class >= PrivacyClass::Restricted {
        rules.push(MinimizationRule::new("raw_audio", RedactionAction::Drop));
        rules.push(MinimizationRule::new("raw_video", RedactionAction::Drop));
        rules.push(MinimizationRule::new("sensor_readings", RedactionAction::Aggregate));
    }
    rules
}

pub fn retry_policy(step_type: StepType) -> RetryPolicy {
    match step_type {
        StepType::DeviceControl => RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 200,
            backoff_multiplier: 2.0,
            max_backoff_ms: 2_000,
        },
        StepType::MlInference | StepType::DataAnalysis => RetryPolicy {
            max_attempts: 2,
            initial_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10_000,
        },
        StepType::Notification => RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 500,
            backoff_multiplier: 1.5,
            max_backoff_ms: 30_000,
        },
        _ => RetryPolicy::default(),
    }
}

/// Compensating actions for a bound step; always ends with releasing its reservation
pub fn rollback_hooks(bound: &BoundStep) -> Vec<String> {
    let mut hooks = match bound.step.step_type {
        StepType::DeviceControl => vec![format!("restore_device_state:{}", bound.resource_id())],
        StepType::StorageOperation => vec![format!("revert_write:{}", bound.step_id())],
        StepType::Automation => vec![format!("disable_automation:{}", bound.step_id())],
        StepType::DataCollection => vec![format!("discard_collected:{}", bound.step_id())],
        _ => Vec::new(),
    };
    hooks.push(format!("release_reservation:{}", bound.reservation.reservation_id));
    hooks
}

/// Attaches run-time configuration to bound steps
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionPrepper;

impl ExecutionPrepper {
    pub fn new() -> Self {
        Self
    }

    /// Fill in the run configuration; nothing else on the step changes
    pub fn prepare_step(&self, bound: BoundStep, request: &AllocationRequest) -> BoundStep {
        let class = resolve_privacy_class(&bound.step, request);
        let run_config = RunConfiguration {
            consent_scope: consent_scope(
                class,
                &request.user_id,
                bound.step.step_type,
                bound.step_id(),
            ),
            data_minimization: minimization_rules(class),
            retry_policy: retry_policy(bound.step.step_type),
            rollback_hooks: rollback_hooks(&bound),
        };
        bound.with_run_config(run_config)
    }
}
