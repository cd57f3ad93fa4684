mod common;

use anyhow::Result;
use common::*;
use intentmesh_config::AllocatorConfig;
use intentmesh_types::{
    AllocationStatus, ExecutionStep, PlacementTarget, Protocol, ResourceCapability, ResourceType,
    StepType,
};
use resource_allocator::{InMemoryResourceRegistry, LoggingExecutor};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_missing_capability_is_infeasible() -> Result<()> {
    let cloud = ResourceCapability::new("cloud-1", ResourceType::CloudCompute)
        .with_protocols(&[Protocol::Http, Protocol::Grpc])
        .with_slots(64);
    let (allocator, _registry) = create_test_allocator(vec![cloud]);
    let request = create_test_request(
        "warm-up",
        vec![ExecutionStep::new("heat", StepType::DeviceControl).with_capability("thermostat")],
    );

    let response = allocator.allocate_resources(request).await;

    assert_eq!(response.status, AllocationStatus::Failed);
    assert!(!response.is_success());
    assert!(response.errors.iter().any(|e| e.contains("thermostat")));
    assert!(response.bound_steps.is_empty());
    assert_eq!(allocator.reservation_store().active_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_two_light_steps_bind_distinct_devices() -> Result<()> {
    let (allocator, _registry) = create_test_allocator(vec![
        create_test_lamp("lamp-1"),
        create_test_lamp("lamp-2"),
    ]);
    let request = create_test_request("lights", vec![light_step("kitchen"), light_step("hall")]);

    let response = allocator.allocate_resources_with_id("a1", request).await;
    assert!(response.is_success(), "errors: {:?}", response.errors);
    assert_eq!(response.status, AllocationStatus::Reserved);

    let resources: HashSet<&str> = response.bound_steps.iter().map(|b| b.resource_id()).collect();
    assert_eq!(resources.len(), 2, "both steps landed on one lamp");
    assert!(response
        .bound_steps
        .iter()
        .all(|b| b.placement.target == PlacementTarget::LocalDevice && b.reservation.exclusive));

    wait_for_status(&allocator, "a1", AllocationStatus::Dispatched).await;
    let reservations = allocator.reservation_store().all().await?;
    assert_eq!(reservations.len(), 2);
    assert_no_exclusive_overlap(&reservations);
    Ok(())
}

#[tokio::test]
async fn test_inference_stays_off_the_cloud_for_internal_data() -> Result<()> {
    let cloud = ResourceCapability::new("cloud-1", ResourceType::CloudCompute)
        .with_protocols(&[Protocol::Http, Protocol::Grpc])
        .with_network(0.99, 1000.0, 60.0)
        .with_slots(64);
    let (allocator, _registry) = create_test_allocator(vec![cloud, create_test_hub("hub-1")]);
    let request = create_test_request(
        "presence",
        vec![ExecutionStep::new("detect", StepType::MlInference).with_duration_ms(500)],
    );

    let response = allocator.allocate_resources(request).await;
    assert!(response.is_success(), "errors: {:?}", response.errors);

    let bound = &response.bound_steps[0];
    assert_eq!(bound.resource_id(), "hub-1");
    assert_eq!(bound.placement.target, PlacementTarget::EdgeGateway);
    assert!(bound
        .placement
        .fallback_resources
        .iter()
        .all(|r| r.resource_id != "cloud-1"));
    assert!(response.placement_rationale.contains("hub-1"));
    Ok(())
}

#[tokio::test]
async fn test_execution_feedback_completes_and_releases() -> Result<()> {
    let (allocator, _registry) = create_test_allocator(vec![create_test_lamp("lamp-1")]);
    let request = create_test_request("lights", vec![light_step("lights")]);

    let response = allocator.allocate_resources_with_id("a1", request).await;
    assert!(response.is_success(), "errors: {:?}", response.errors);
    wait_for_status(&allocator, "a1", AllocationStatus::Dispatched).await;

    assert!(allocator.report_execution_started("a1").await);
    assert_eq!(allocator.get_allocation_status("a1").await, Some(AllocationStatus::Executing));

    assert!(allocator.report_execution_finished("a1", true, None).await);
    assert_eq!(allocator.get_allocation_status("a1").await, Some(AllocationStatus::Completed));
    assert_eq!(allocator.reservation_store().active_count().await?, 0);

    // terminal allocations ignore further feedback
    assert!(!allocator.report_execution_finished("a1", false, None).await);
    assert!(!allocator.cancel_allocation("a1").await);
    assert_eq!(
        allocator.telemetry().allocations.with_label_values(&["completed"]).get(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_snapshot_moves_state_to_a_new_allocator() -> Result<()> {
    let (allocator, _registry) = create_test_allocator(vec![create_test_lamp("lamp-1")]);
    let request = create_test_request("lights", vec![light_step("lights")]);
    let response = allocator.allocate_resources_with_id("a1", request).await;
    assert!(response.is_success(), "errors: {:?}", response.errors);
    wait_for_status(&allocator, "a1", AllocationStatus::Dispatched).await;

    let snapshot = allocator.snapshot().await?;
    let json = snapshot.to_json()?;

    let (restored, _registry) = create_test_allocator(vec![create_test_lamp("lamp-1")]);
    let report = restored
        .restore(&resource_allocator::AllocatorSnapshot::from_json(&json)?)
        .await?;

    assert_eq!(report.records, 1);
    assert_eq!(report.reservations, 1);
    assert!(report.rejected_reservations.is_empty());
    assert_eq!(
        restored.get_allocation_status("a1").await,
        Some(AllocationStatus::Dispatched)
    );

    // the restored reservation still blocks the lamp
    let blocked = restored
        .allocate_resources(create_test_request("more-lights", vec![light_step("again")]))
        .await;
    assert_eq!(blocked.status, AllocationStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn test_cancel_interrupts_an_in_flight_allocation() -> Result<()> {
    let registry = Arc::new(StalledRegistry::new(vec![create_test_lamp("lamp-1")], &[0]));
    let allocator =
        create_test_allocator_on(registry, Arc::new(LoggingExecutor), AllocatorConfig::default());

    let allocating = {
        let allocator = allocator.clone();
        tokio::spawn(async move {
            allocator
                .allocate_resources_with_id(
                    "a1",
                    create_test_request("lights", vec![light_step("lights")]),
                )
                .await
        })
    };
    wait_for_status(&allocator, "a1", AllocationStatus::FeasibilityCheck).await;

    assert!(allocator.cancel_allocation("a1").await);
    let response = tokio::time::timeout(Duration::from_secs(3), allocating).await??;
    assert_eq!(response.status, AllocationStatus::Cancelled);
    assert!(response.bound_steps.is_empty());
    assert_eq!(allocator.get_allocation_status("a1").await, Some(AllocationStatus::Cancelled));
    assert_eq!(allocator.reservation_store().active_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_feasibility_timeout_fails_only_the_stalled_step() -> Result<()> {
    // the second of the two step scans hangs
    let registry = Arc::new(StalledRegistry::new(
        vec![create_test_lamp("lamp-1"), create_test_hub("hub-1")],
        &[1],
    ));
    let mut config = AllocatorConfig::default();
    config.timeouts.feasibility_ms = 200;
    let allocator = create_test_allocator_on(registry, Arc::new(LoggingExecutor), config);
    let steps = || vec![light_step("lights"), ExecutionStep::new("notify", StepType::Notification)];

    let response = tokio::time::timeout(
        Duration::from_secs(3),
        allocator.allocate_resources_with_id("a1", create_test_request("evening", steps())),
    )
    .await?;
    assert_eq!(response.status, AllocationStatus::Failed);
    assert_eq!(response.errors.len(), 1, "errors: {:?}", response.errors);
    assert!(response.errors[0].contains("is unknown"));
    assert!(response.errors[0].contains("feasibility phase timed out after 200ms"));
    assert_eq!(allocator.reservation_store().active_count().await?, 0);

    // later scans are not stalled and nothing is left behind
    let retry = allocator
        .allocate_resources_with_id("a2", create_test_request("evening", steps()))
        .await;
    assert!(retry.is_success(), "errors: {:?}", retry.errors);
    assert_eq!(retry.bound_steps.len(), 2);
    Ok(())
}

fn short_reservations() -> AllocatorConfig {
    let mut config = AllocatorConfig::default();
    config.binding.reservation_timeout_secs = 1;
    config.binding.expiry_sweep_interval_secs = 1;
    config
}

#[tokio::test]
async fn test_expired_reservations_fail_an_undispatched_allocation() -> Result<()> {
    let registry = Arc::new(InMemoryResourceRegistry::from_resources(vec![create_test_lamp(
        "lamp-1",
    )]));
    let allocator =
        create_test_allocator_on(registry, Arc::new(StalledExecutor), short_reservations());

    let response = allocator
        .allocate_resources_with_id("a1", create_test_request("lights", vec![light_step("lights")]))
        .await;
    assert_eq!(response.status, AllocationStatus::Reserved);
    assert_eq!(allocator.expire_stale_reservations().await, 0);

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(allocator.expire_stale_reservations().await, 1);

    assert_eq!(allocator.get_allocation_status("a1").await, Some(AllocationStatus::Failed));
    let allocation = allocator.get_allocation("a1").await.expect("allocation exists");
    assert!(allocation
        .last_error
        .unwrap_or_default()
        .contains("expired before dispatch"));
    assert_eq!(allocator.reservation_store().active_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_maintenance_sweeps_expired_reservations() -> Result<()> {
    let registry = Arc::new(InMemoryResourceRegistry::from_resources(vec![create_test_lamp(
        "lamp-1",
    )]));
    let allocator =
        create_test_allocator_on(registry, Arc::new(StalledExecutor), short_reservations());

    let response = allocator
        .allocate_resources_with_id("a1", create_test_request("lights", vec![light_step("lights")]))
        .await;
    assert_eq!(response.status, AllocationStatus::Reserved);

    let maintenance = allocator.start_maintenance();
    let mut status = None;
    for _ in 0..50 {
        status = allocator.get_allocation_status("a1").await;
        if status == Some(AllocationStatus::Failed) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(status, Some(AllocationStatus::Failed));
    assert_eq!(allocator.reservation_store().active_count().await?, 0);

    tokio::time::timeout(Duration::from_secs(2), maintenance.shutdown()).await?;
    Ok(())
}
