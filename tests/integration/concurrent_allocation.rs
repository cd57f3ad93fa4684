mod common;

use anyhow::Result;
use common::*;
use futures::future::join_all;
use intentmesh_types::AllocationStatus;
use std::collections::HashSet;

#[tokio::test]
async fn test_same_exclusive_device_has_one_winner() -> Result<()> {
    let (allocator, _registry) = create_test_allocator(vec![create_test_lamp("lamp-1")]);

    let attempts = (0..8).map(|i| {
        let allocator = allocator.clone();
        async move {
            let request = create_test_request(&format!("plan-{}", i), vec![light_step("lights")]);
            allocator.allocate_resources(request).await
        }
    });
    let responses = join_all(attempts).await;

    let winners: Vec<_> = responses.iter().filter(|r| r.is_success()).collect();
    assert_eq!(winners.len(), 1, "exactly one allocation may hold the lamp");
    for loser in responses.iter().filter(|r| !r.is_success()) {
        assert_eq!(loser.status, AllocationStatus::Failed);
        assert!(loser.bound_steps.is_empty());
    }

    let reservations = allocator.reservation_store().all().await?;
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0].allocation_id, winners[0].allocation_id);
    assert!(allocator.telemetry().reservation_conflicts.get() >= 1);
    Ok(())
}

#[tokio::test]
async fn test_spawned_allocations_never_overlap_exclusive_reservations() -> Result<()> {
    let lamps = (0..4).map(|i| create_test_lamp(&format!("lamp-{}", i))).collect();
    let (allocator, _registry) = create_test_allocator(lamps);

    let mut handles = Vec::new();
    for i in 0..12 {
        let allocator = allocator.clone();
        handles.push(tokio::spawn(async move {
            let request = create_test_request(
                &format!("plan-{}", i),
                vec![light_step("a"), light_step("b")],
            );
            allocator.allocate_resources(request).await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        let response = handle.await?;
        if response.is_success() {
            let used: HashSet<&str> =
                response.bound_steps.iter().map(|b| b.resource_id()).collect();
            assert_eq!(used.len(), 2);
            successes += 1;
        } else {
            assert!(allocator
                .reservation_store()
                .reservations_for_allocation(&response.allocation_id)
                .await?
                .is_empty());
        }
    }

    // four lamps, two per plan
    assert!(successes <= 2, "{} plans bound", successes);
    assert_no_exclusive_overlap(&allocator.reservation_store().all().await?);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_winner_frees_the_device() -> Result<()> {
    let (allocator, _registry) = create_test_allocator(vec![create_test_lamp("lamp-1")]);

    let first = allocator
        .allocate_resources(create_test_request("first", vec![light_step("lights")]))
        .await;
    assert!(first.is_success(), "errors: {:?}", first.errors);

    let blocked = allocator
        .allocate_resources(create_test_request("second", vec![light_step("lights")]))
        .await;
    assert_eq!(blocked.status, AllocationStatus::Failed);

    assert!(allocator.cancel_allocation(&first.allocation_id).await);
    let retried = allocator
        .allocate_resources(create_test_request("third", vec![light_step("lights")]))
        .await;
    assert!(retried.is_success(), "errors: {:?}", retried.errors);
    assert_eq!(retried.bound_steps[0].resource_id(), "lamp-1");
    Ok(())
}
