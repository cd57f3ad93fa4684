#![allow(dead_code)]

use async_trait::async_trait;
use intentmesh_config::AllocatorConfig;
use intentmesh_types::{
    AllocationRequest, AllocationStatus, ExecutionPlan, ExecutionStep, Protocol,
    ResourceAllocation, ResourceCapability, ResourceReservation, ResourceType, StepType,
};
use resource_allocator::{
    ExecutionBackend, ExecutorError, InMemoryResourceRegistry, RegistryError, ResourceAllocator,
    ResourceRegistry,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Backend that takes far longer than any test waits
pub struct StalledExecutor;

#[async_trait]
impl ExecutionBackend for StalledExecutor {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn submit(&self, _allocation: &ResourceAllocation) -> Result<String, ExecutorError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok("never".to_string())
    }
}

/// Registry that hangs on chosen `get_all_devices` calls, counted from zero
pub struct StalledRegistry {
    inner: InMemoryResourceRegistry,
    stalled_calls: Vec<usize>,
    calls: AtomicUsize,
}

impl StalledRegistry {
    pub fn new(resources: Vec<ResourceCapability>, stalled_calls: &[usize]) -> Self {
        Self {
            inner: InMemoryResourceRegistry::from_resources(resources),
            stalled_calls: stalled_calls.to_vec(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ResourceRegistry for StalledRegistry {
    async fn get_all_devices(&self) -> Result<Vec<ResourceCapability>, RegistryError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.stalled_calls.contains(&call) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.inner.get_all_devices().await
    }

    async fn get_device_capabilities(
        &self,
        resource_id: &str,
    ) -> Result<Option<ResourceCapability>, RegistryError> {
        self.inner.get_device_capabilities(resource_id).await
    }
}

pub fn create_test_lamp(id: &str) -> ResourceCapability {
    ResourceCapability::new(id, ResourceType::Device)
        .with_capability("light")
        .with_protocols(&[Protocol::Zigbee])
        .with_location("living_room")
}

pub fn create_test_hub(id: &str) -> ResourceCapability {
    ResourceCapability::new(id, ResourceType::EdgeCompute)
        .with_protocols(&[Protocol::Http, Protocol::Grpc, Protocol::Mqtt])
        .with_slots(4)
        .with_cost_per_hour(0.002)
}

pub fn create_test_allocator(
    resources: Vec<ResourceCapability>,
) -> (Arc<ResourceAllocator>, Arc<InMemoryResourceRegistry>) {
    create_test_allocator_with(resources, AllocatorConfig::default())
}

pub fn create_test_allocator_with(
    resources: Vec<ResourceCapability>,
    config: AllocatorConfig,
) -> (Arc<ResourceAllocator>, Arc<InMemoryResourceRegistry>) {
    let registry = Arc::new(InMemoryResourceRegistry::from_resources(resources));
    let allocator = ResourceAllocator::new(registry.clone(), config)
        .expect("default test config is valid");
    (Arc::new(allocator), registry)
}

/// Allocator over an arbitrary registry and backend
pub fn create_test_allocator_on(
    registry: Arc<dyn ResourceRegistry>,
    backend: Arc<dyn ExecutionBackend>,
    config: AllocatorConfig,
) -> Arc<ResourceAllocator> {
    let allocator = ResourceAllocator::builder(registry)
        .backend(backend)
        .config(config)
        .build()
        .expect("test config is valid");
    Arc::new(allocator)
}

pub fn create_test_request(plan_id: &str, steps: Vec<ExecutionStep>) -> AllocationRequest {
    AllocationRequest::new(ExecutionPlan::new(plan_id, steps), "user-1")
}

pub fn light_step(id: &str) -> ExecutionStep {
    ExecutionStep::new(id, StepType::DeviceControl).with_capability("light")
}

pub async fn wait_for_status(allocator: &ResourceAllocator, id: &str, status: AllocationStatus) {
    for _ in 0..200 {
        if allocator.get_allocation_status(id).await == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("allocation {} never reached {}", id, status);
}

/// Panics if two exclusive reservations on one resource overlap in time
pub fn assert_no_exclusive_overlap(reservations: &[ResourceReservation]) {
    for (i, a) in reservations.iter().enumerate() {
        for b in &reservations[i + 1..] {
            if a.resource_id == b.resource_id && (a.exclusive || b.exclusive) {
                assert!(
                    !a.overlaps(b),
                    "reservations {} and {} overlap on {}",
                    a.reservation_id,
                    b.reservation_id,
                    a.resource_id
                );
            }
        }
    }
}
