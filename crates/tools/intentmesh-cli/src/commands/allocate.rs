use crate::context::{load_request, CliContext};
use crate::error::{CliError, CliResult};
use clap::Args;
use colored::Colorize;
use intentmesh_types::{
    AllocationResponse, AllocationStatus, PowerState, RebindReason, RebindingRequest,
};
use log::{debug, info};
use resource_allocator::{InMemoryResourceRegistry, ResourceAllocator, ResourceRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Allocate resources for an execution plan against a registry file
#[derive(Args, Debug, Clone)]
pub struct AllocateArgs {
    /// JSON file with the resource registry (array of capabilities)
    #[arg(short, long)]
    pub registry: PathBuf,

    /// JSON file with the allocation request
    #[arg(short = 'q', long)]
    pub request: PathBuf,

    /// Allocator config file (TOML); defaults are used when omitted
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// How long to wait for the background dispatch before reporting
    #[arg(long, default_value = "200")]
    pub wait_ms: u64,

    /// Take a resource offline after dispatch and rebind the steps using it
    #[arg(long)]
    pub offline: Option<String>,

    /// Print the final response as JSON instead of a summary
    #[arg(long)]
    pub json: bool,

    /// Print allocation metrics and the prometheus exposition
    #[arg(long)]
    pub metrics: bool,
}

pub async fn handle_allocate_command(args: &AllocateArgs) -> CliResult {
    let context = CliContext::load(&args.registry, args.config.as_deref())?;
    let request = load_request(&args.request)?;
    info!(
        "Allocating plan {} ({} steps) for {}",
        request.plan_id(),
        request.plan.steps.len(),
        request.user_id
    );

    let registry = context.registry.clone();
    let allocator = ResourceAllocator::builder(registry.clone() as Arc<dyn ResourceRegistry>)
        .config(context.config)
        .build()?;

    let mut response = allocator.allocate_resources(request).await;
    let allocation_id = response.allocation_id.clone();

    if response.is_success() && args.wait_ms > 0 {
        tokio::time::sleep(Duration::from_millis(args.wait_ms)).await;
        if let Some(allocation) = allocator.get_allocation(&allocation_id).await {
            response = AllocationResponse::from_allocation(&allocation, response.warnings);
        }
    }

    if let Some(resource_id) = &args.offline {
        response = take_offline(&allocator, &registry, response, resource_id).await;
    }

    if args.json {
        let json = serde_json::to_string_pretty(&response)
            .map_err(|e| CliError::Serialize(e.to_string()))?;
        println!("{}", json);
    } else {
        print_response(&response);
    }

    if args.metrics {
        if let Some(metrics) = allocator.get_allocation_metrics(&allocation_id).await {
            println!("\nAllocation metrics:");
            println!("  Placement accuracy:    {:.3}", metrics.placement_accuracy);
            println!("  Rebinding rate:        {:.3}", metrics.rebinding_rate);
            println!("  Local execution ratio: {:.3}", metrics.local_execution_ratio);
            println!("  Device utilization:    {:.3}", metrics.device_utilization);
            println!("  Binding latency:       {:.1}ms", metrics.binding_latency_ms);
            println!("  Privacy compliance:    {:.3}", metrics.privacy_compliance);
            println!("  Energy compliance:     {:.3}", metrics.energy_compliance);
        }
        println!("\n{}", allocator.telemetry().gather_text());
    }

    match response.status {
        AllocationStatus::Failed | AllocationStatus::Cancelled => Err(CliError::AllocationFailed {
            allocation_id,
            status: response.status,
        }),
        _ => Ok(()),
    }
}

async fn take_offline(
    allocator: &ResourceAllocator,
    registry: &InMemoryResourceRegistry,
    mut response: AllocationResponse,
    resource_id: &str,
) -> AllocationResponse {
    if !registry.set_power_state(resource_id, PowerState::Offline).await {
        response
            .warnings
            .push(format!("resource {} is not in the registry", resource_id));
        return response;
    }
    println!("Resource {} went offline", resource_id);

    let affected: Vec<String> = response
        .bound_steps
        .iter()
        .filter(|b| b.resource_id() == resource_id)
        .map(|b| b.step_id().to_string())
        .collect();
    debug!("Steps bound to {}: {:?}", resource_id, affected);

    for step_id in affected {
        let mut request = RebindingRequest::new(
            &response.allocation_id,
            &step_id,
            RebindReason::ResourceOffline,
            resource_id,
        );
        request.detail = Some("taken offline from the command line".to_string());
        response = allocator.rebind_resources(request).await;
    }
    response
}

fn print_response(response: &AllocationResponse) {
    let status = match response.status {
        AllocationStatus::Failed | AllocationStatus::Cancelled => {
            response.status.as_str().red().bold()
        }
        _ => response.status.as_str().green().bold(),
    };
    println!("Allocation: {}", response.allocation_id);
    println!("Status: {}", status);

    if !response.bound_steps.is_empty() {
        println!("\nBound steps:");
        for bound in &response.bound_steps {
            let fallback = if bound.used_fallback { " (fallback)" } else { "" };
            println!(
                "  {} -> {} [{}] reservation {}{}",
                bound.step_id(),
                bound.resource_id(),
                bound.placement.target,
                bound.reservation.reservation_id,
                fallback
            );
        }
        println!("\nExpected cost: ${:.6}", response.expected_cost);
        println!("Expected latency: {:.1}ms", response.expected_latency_ms);
        println!("Privacy score: {:.2}", response.privacy_score);
        println!("\nRationale:");
        for line in response.placement_rationale.split("; ") {
            println!("  {}", line);
        }
    }

    if !response.warnings.is_empty() {
        println!("\nWarnings:");
        for warning in &response.warnings {
            println!("  {} {}", "!".yellow(), warning);
        }
    }
    if !response.errors.is_empty() {
        println!("\nErrors:");
        for error in &response.errors {
            println!("  {} {}", "x".red(), error);
        }
    }
}
