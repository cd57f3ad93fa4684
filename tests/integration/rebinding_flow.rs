mod common;

use anyhow::Result;
use common::*;
use intentmesh_config::AllocatorConfig;
use intentmesh_types::{
    AllocationResponse, AllocationStatus, ExecutionStep, PowerState, RebindReason,
    RebindingRequest, StepType,
};
use resource_allocator::{InMemoryResourceRegistry, LoggingExecutor, ResourceAllocator};
use std::sync::Arc;
use std::time::Duration;

async fn rebind_offline_lamp(allocator: &ResourceAllocator) -> AllocationResponse {
    allocator
        .rebind_resources(RebindingRequest::new(
            "a1",
            "lights",
            RebindReason::ResourceOffline,
            "lamp-1",
        ))
        .await
}

#[tokio::test]
async fn test_offline_device_is_rebound_to_a_peer() -> Result<()> {
    let (allocator, registry) = create_test_allocator(vec![
        create_test_lamp("lamp-1"),
        create_test_lamp("lamp-2"),
        create_test_hub("hub-1"),
    ]);
    let request = create_test_request(
        "evening",
        vec![light_step("lights"), ExecutionStep::new("notify", StepType::Notification)],
    );
    let response = allocator.allocate_resources_with_id("a1", request).await;
    assert!(response.is_success(), "errors: {:?}", response.errors);
    wait_for_status(&allocator, "a1", AllocationStatus::Dispatched).await;

    let before = allocator.get_allocation("a1").await.expect("allocation exists");
    let notify_reservation = before
        .bound_step("notify")
        .map(|b| b.reservation.reservation_id.clone())
        .expect("notify is bound");
    let original = before
        .bound_step("lights")
        .map(|b| b.resource_id().to_string())
        .expect("lights is bound");
    registry.set_power_state(&original, PowerState::Offline).await;

    let rebound = allocator
        .rebind_resources(RebindingRequest::new(
            "a1",
            "lights",
            RebindReason::ResourceOffline,
            &original,
        ))
        .await;
    assert!(rebound.is_success(), "errors: {:?}", rebound.errors);
    assert!(rebound.warnings.iter().any(|w| w.contains("rebound from")));

    // rebinding a dispatched allocation hands it to the executor again
    wait_for_status(&allocator, "a1", AllocationStatus::Dispatched).await;

    let after = allocator.get_allocation("a1").await.expect("allocation exists");
    let lights = after.bound_step("lights").expect("lights is bound");
    assert_ne!(lights.resource_id(), original);
    assert_eq!(
        after.bound_step("notify").map(|b| b.reservation.reservation_id.as_str()),
        Some(notify_reservation.as_str())
    );
    assert_eq!(after.rebind_attempts_for("lights"), 1);

    let store = allocator.reservation_store();
    assert!(store.reservations_for_resource(&original).await?.is_empty());
    assert_eq!(store.reservations_for_allocation("a1").await?.len(), 2);

    let metrics = allocator.get_allocation_metrics("a1").await.expect("metrics exist");
    assert!(metrics.rebinding_rate > 0.0);
    Ok(())
}

#[tokio::test]
async fn test_rebinding_without_alternatives_exhausts() -> Result<()> {
    let (allocator, registry) = create_test_allocator(vec![create_test_lamp("lamp-1")]);
    let max_attempts = AllocatorConfig::default().rebinding.max_attempts;

    let response = allocator
        .allocate_resources_with_id("a1", create_test_request("lights", vec![light_step("lights")]))
        .await;
    assert!(response.is_success(), "errors: {:?}", response.errors);
    wait_for_status(&allocator, "a1", AllocationStatus::Dispatched).await;
    registry.set_power_state("lamp-1", PowerState::Offline).await;

    for _ in 1..max_attempts {
        let attempt = rebind_offline_lamp(&allocator).await;
        assert!(!attempt.is_success());
        assert_eq!(attempt.status, AllocationStatus::Reserved);
        // the old binding is kept until a replacement exists
        assert_eq!(attempt.bound_steps[0].resource_id(), "lamp-1");
    }

    let last = rebind_offline_lamp(&allocator).await;
    assert_eq!(last.status, AllocationStatus::Failed);
    assert!(last.errors.iter().any(|e| e.contains("exhausted")));
    assert_eq!(allocator.get_allocation_status("a1").await, Some(AllocationStatus::Failed));
    assert_eq!(allocator.reservation_store().active_count().await?, 0);

    let after = rebind_offline_lamp(&allocator).await;
    assert!(!after.is_success());
    Ok(())
}

#[tokio::test]
async fn test_cancel_is_idempotent_and_releases_everything() -> Result<()> {
    let (allocator, _registry) = create_test_allocator(vec![
        create_test_lamp("lamp-1"),
        create_test_hub("hub-1"),
    ]);
    let request = create_test_request(
        "evening",
        vec![
            light_step("lights"),
            ExecutionStep::new("notify", StepType::Notification),
        ],
    );
    let response = allocator.allocate_resources_with_id("a1", request).await;
    assert!(response.is_success(), "errors: {:?}", response.errors);

    assert!(allocator.cancel_allocation("a1").await);
    assert!(!allocator.cancel_allocation("a1").await);
    assert_eq!(allocator.get_allocation_status("a1").await, Some(AllocationStatus::Cancelled));
    assert_eq!(allocator.reservation_store().active_count().await?, 0);

    let rebind = allocator
        .rebind_resources(RebindingRequest::new("a1", "lights", RebindReason::Manual, "lamp-1"))
        .await;
    assert!(!rebind.is_success());
    assert_eq!(
        allocator.telemetry().allocations.with_label_values(&["cancelled"]).get(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_cancel_interrupts_a_stalled_dispatch() -> Result<()> {
    let registry = Arc::new(InMemoryResourceRegistry::from_resources(vec![create_test_lamp(
        "lamp-1",
    )]));
    let allocator = ResourceAllocator::builder(registry)
        .backend(Arc::new(StalledExecutor))
        .build()?;

    let response = allocator
        .allocate_resources_with_id("a1", create_test_request("lights", vec![light_step("lights")]))
        .await;
    assert_eq!(response.status, AllocationStatus::Reserved);

    let cancelled = tokio::time::timeout(Duration::from_secs(5), allocator.cancel_allocation("a1"))
        .await?;
    assert!(cancelled);
    assert_eq!(allocator.get_allocation_status("a1").await, Some(AllocationStatus::Cancelled));
    assert!(allocator
        .reservation_store()
        .reservations_for_resource("lamp-1")
        .await?
        .is_empty());
    Ok(())
}

fn short_rebind_timeout() -> AllocatorConfig {
    let mut config = AllocatorConfig::default();
    config.rebinding.timeout_ms = 200;
    config
}

#[tokio::test]
async fn test_rebind_does_not_wait_forever_on_a_stalled_dispatch() -> Result<()> {
    let registry = Arc::new(InMemoryResourceRegistry::from_resources(vec![
        create_test_lamp("lamp-1"),
        create_test_lamp("lamp-2"),
    ]));
    let allocator = create_test_allocator_on(
        registry.clone(),
        Arc::new(StalledExecutor),
        short_rebind_timeout(),
    );

    let response = allocator
        .allocate_resources_with_id("a1", create_test_request("lights", vec![light_step("lights")]))
        .await;
    assert_eq!(response.status, AllocationStatus::Reserved);
    registry.set_power_state("lamp-1", PowerState::Offline).await;

    let rebind =
        tokio::time::timeout(Duration::from_secs(3), rebind_offline_lamp(&allocator)).await?;
    assert!(!rebind.is_success());
    assert!(rebind.errors.iter().any(|e| e.contains("rebinding phase timed out")));
    assert_eq!(rebind.status, AllocationStatus::Reserved);
    assert_eq!(rebind.bound_steps[0].resource_id(), "lamp-1");

    // the dispatch is still tracked, so cancel can stop it
    let cancelled =
        tokio::time::timeout(Duration::from_secs(3), allocator.cancel_allocation("a1")).await?;
    assert!(cancelled);
    assert_eq!(allocator.get_allocation_status("a1").await, Some(AllocationStatus::Cancelled));
    assert_eq!(allocator.reservation_store().active_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_cancel_interrupts_an_in_flight_rebind() -> Result<()> {
    // call 0 is the allocation scan, call 1 the rebind scan
    let registry = Arc::new(StalledRegistry::new(
        vec![create_test_lamp("lamp-1"), create_test_lamp("lamp-2")],
        &[1],
    ));
    let allocator =
        create_test_allocator_on(registry, Arc::new(LoggingExecutor), AllocatorConfig::default());

    let response = allocator
        .allocate_resources_with_id("a1", create_test_request("lights", vec![light_step("lights")]))
        .await;
    assert!(response.is_success(), "errors: {:?}", response.errors);
    wait_for_status(&allocator, "a1", AllocationStatus::Dispatched).await;

    let rebinding = {
        let allocator = allocator.clone();
        tokio::spawn(async move {
            allocator
                .rebind_resources(RebindingRequest::new(
                    "a1",
                    "lights",
                    RebindReason::Manual,
                    "lamp-1",
                ))
                .await
        })
    };
    wait_for_status(&allocator, "a1", AllocationStatus::Rebinding).await;

    assert!(allocator.cancel_allocation("a1").await);
    let rebind = tokio::time::timeout(Duration::from_secs(3), rebinding).await??;
    assert_eq!(rebind.status, AllocationStatus::Cancelled);
    assert_eq!(allocator.get_allocation_status("a1").await, Some(AllocationStatus::Cancelled));
    assert_eq!(allocator.reservation_store().active_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_rebind_timeout_leaves_sibling_steps_alone() -> Result<()> {
    // calls 0 and 1 scan the two steps, call 2 is the rebind scan
    let registry = Arc::new(StalledRegistry::new(
        vec![
            create_test_lamp("lamp-1"),
            create_test_lamp("lamp-2"),
            create_test_hub("hub-1"),
        ],
        &[2],
    ));
    let allocator =
        create_test_allocator_on(registry, Arc::new(LoggingExecutor), short_rebind_timeout());

    let request = create_test_request(
        "evening",
        vec![light_step("lights"), ExecutionStep::new("notify", StepType::Notification)],
    );
    let response = allocator.allocate_resources_with_id("a1", request).await;
    assert!(response.is_success(), "errors: {:?}", response.errors);
    wait_for_status(&allocator, "a1", AllocationStatus::Dispatched).await;
    let before = allocator.get_allocation("a1").await.expect("allocation exists");

    let rebind = tokio::time::timeout(
        Duration::from_secs(3),
        allocator.rebind_resources(RebindingRequest::new(
            "a1",
            "lights",
            RebindReason::Manual,
            "lamp-1",
        )),
    )
    .await?;
    assert!(!rebind.is_success());
    assert!(rebind.errors.iter().any(|e| e.contains("rebinding phase timed out")));
    assert_eq!(rebind.status, AllocationStatus::Reserved);

    let after = allocator.get_allocation("a1").await.expect("allocation exists");
    assert_eq!(after.reservation_ids(), before.reservation_ids());
    assert_eq!(after.rebind_attempts_for("lights"), 1);
    assert_eq!(
        allocator.reservation_store().reservations_for_allocation("a1").await?.len(),
        2
    );
    Ok(())
}
