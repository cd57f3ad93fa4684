use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Kind of work an execution step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Drive a device (switch a light, lock a door)
    DeviceControl,
    /// Read sensors or device state
    DataCollection,
    /// Run a model over collected data
    MlInference,
    /// Notify a user
    Notification,
    /// Aggregate or analyse data
    DataAnalysis,
    /// Persist or fetch data
    StorageOperation,
    /// Evaluate an automation rule
    Automation,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::DeviceControl => "device_control",
            StepType::DataCollection => "data_collection",
            StepType::MlInference => "ml_inference",
            StepType::Notification => "notification",
            StepType::DataAnalysis => "data_analysis",
            StepType::StorageOperation => "storage_operation",
            StepType::Automation => "automation",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sensitivity tier of the data a step touches, least to most sensitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyClass {
    Public,
    Internal,
    Confidential,
    Restricted,
}

impl PrivacyClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivacyClass::Public => "public",
            PrivacyClass::Internal => "internal",
            PrivacyClass::Confidential => "confidential",
            PrivacyClass::Restricted => "restricted",
        }
    }
}

impl fmt::Display for PrivacyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of an execution plan. Read-only to the allocator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// Step identifier, unique within the plan
    pub step_id: String,

    /// Kind of work
    pub step_type: StepType,

    /// Preferred resource for this step
    #[serde(default)]
    pub target_device: Option<String>,

    /// Capability tag the resource must advertise
    #[serde(default)]
    pub required_capability: Option<String>,

    /// Step parameters, opaque to the allocator
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,

    /// Steps that must finish before this one starts
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Privacy class attached by the planner
    #[serde(default)]
    pub privacy_class: Option<PrivacyClass>,

    /// Planner's duration estimate in milliseconds (0 when unknown)
    #[serde(default)]
    pub estimated_duration_ms: u64,

    /// Planner's cost estimate in dollars
    #[serde(default)]
    pub estimated_cost: f64,
}

impl ExecutionStep {
    pub fn new(step_id: impl Into<String>, step_type: StepType) -> Self {
        Self {
            step_id: step_id.into(),
            step_type,
            target_device: None,
            required_capability: None,
            parameters: HashMap::new(),
            dependencies: Vec::new(),
            privacy_class: None,
            estimated_duration_ms: 0,
            estimated_cost: 0.0,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capability = Some(capability.into());
        self
    }

    pub fn with_target_device(mut self, resource_id: impl Into<String>) -> Self {
        self.target_device = Some(resource_id.into());
        self
    }

    pub fn with_privacy_class(mut self, privacy_class: PrivacyClass) -> Self {
        self.privacy_class = Some(privacy_class);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.estimated_duration_ms = duration_ms;
        self
    }

    pub fn with_dependency(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// Ordered steps produced by the planner. Acyclicity is the planner's contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Plan identifier
    pub plan_id: String,

    /// Steps in plan order
    pub steps: Vec<ExecutionStep>,

    /// Free-form planner metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ExecutionPlan {
    pub fn new(plan_id: impl Into<String>, steps: Vec<ExecutionStep>) -> Self {
        Self {
            plan_id: plan_id.into(),
            steps,
            metadata: HashMap::new(),
        }
    }

    /// Look up a step by id
    pub fn step(&self, step_id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}
