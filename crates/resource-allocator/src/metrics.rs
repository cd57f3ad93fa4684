use crate::placement::{privacy_allowed_targets, resolve_privacy_class};
use chrono::Utc;
use intentmesh_types::{AllocationMetrics, AllocationRequest, PlacementTarget, ResourceAllocation};

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Population variance
fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

/// Share of `count` out of `total`, 1.0 for an empty allocation
fn ratio(count: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        count as f64 / total as f64
    }
}

/// Derive quality metrics from the current state of an allocation
pub fn compute_metrics(
    allocation: &ResourceAllocation,
    request: &AllocationRequest,
) -> AllocationMetrics {
    let steps = &allocation.bound_steps;
    let total = steps.len();

    let on_primary = steps.iter().filter(|b| !b.used_fallback).count();
    let local = steps
        .iter()
        .filter(|b| b.placement.target == PlacementTarget::LocalDevice)
        .count();
    let compliant = steps
        .iter()
        .filter(|b| {
            let class = resolve_privacy_class(&b.step, request);
            privacy_allowed_targets(class).contains(&b.placement.target)
        })
        .count();

    let loads: Vec<f64> = steps
        .iter()
        .map(|b| b.placement.primary_resource.current_load)
        .collect();
    let costs: Vec<f64> = steps.iter().map(|b| b.placement.expected_cost).collect();
    let latencies: Vec<f64> = steps
        .iter()
        .map(|b| b.placement.expected_latency_ms)
        .collect();

    let energy_used: f64 = steps.iter().map(|b| b.placement.estimated_energy_wh).sum();
    let energy_compliance = match request.energy_constraints.max_energy_wh {
        Some(budget) if energy_used > budget && energy_used > 0.0 => {
            (budget / energy_used).max(0.0)
        }
        _ => 1.0,
    };

    AllocationMetrics {
        allocation_id: allocation.allocation_id.clone(),
        placement_accuracy: ratio(on_primary, total),
        rebinding_rate: if total == 0 {
            0.0
        } else {
            allocation.total_rebinds() as f64 / total as f64
        },
        local_execution_ratio: if total == 0 { 0.0 } else { ratio(local, total) },
        device_utilization: mean(&loads),
        binding_latency_ms: allocation.binding_latency_ms,
        cost_variance: variance(&costs),
        latency_variance: variance(&latencies),
        privacy_compliance: ratio(compliant, total),
        energy_compliance,
        computed_at: Utc::now(),
    }
}
