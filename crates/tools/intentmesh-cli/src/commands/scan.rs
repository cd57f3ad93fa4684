use crate::context::{load_request, CliContext};
use crate::error::{CliError, CliResult};
use clap::Args;
use colored::Colorize;
use intentmesh_types::{FeasibilityResult, FeasibilityStatus, Protocol};
use resource_allocator::{
    feasibility::required_protocols, BaselineEstimator, FeasibilityScanner, ResourceRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Check which resources could run each step of a plan, without reserving anything
#[derive(Args, Debug, Clone)]
pub struct ScanArgs {
    /// JSON file with the resource registry (array of capabilities)
    #[arg(short, long)]
    pub registry: PathBuf,

    /// JSON file with the allocation request whose plan is scanned
    #[arg(short = 'q', long)]
    pub request: PathBuf,

    /// Allocator config file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn handle_scan_command(args: &ScanArgs) -> CliResult {
    let context = CliContext::load(&args.registry, args.config.as_deref())?;
    let request = load_request(&args.request)?;
    let scanner = FeasibilityScanner::new(
        context.registry.clone() as Arc<dyn ResourceRegistry>,
        Arc::new(BaselineEstimator),
        context.config.feasibility.clone(),
    );

    let mut results = Vec::with_capacity(request.plan.steps.len());
    for step in &request.plan.steps {
        results.push(scanner.check_feasibility(step).await);
    }

    if args.json {
        let json = serde_json::to_string_pretty(&results)
            .map_err(|e| CliError::Serialize(e.to_string()))?;
        println!("{}", json);
    } else {
        println!("Plan: {}", request.plan_id());
        for (step, result) in request.plan.steps.iter().zip(&results) {
            print_result(&scanner, result, required_protocols(step.step_type));
        }
    }

    let infeasible = results
        .iter()
        .filter(|r| !r.status.is_allocatable())
        .count();
    if infeasible > 0 {
        return Err(CliError::Infeasible(infeasible));
    }
    Ok(())
}

fn print_result(
    scanner: &FeasibilityScanner,
    result: &FeasibilityResult,
    protocols: &[Protocol],
) {
    let status = match result.status {
        FeasibilityStatus::Feasible => result.status.as_str().green(),
        FeasibilityStatus::Degraded => result.status.as_str().yellow(),
        _ => result.status.as_str().red(),
    };
    println!("\nStep {}: {}", result.step_id, status);
    println!(
        "  Estimated energy: {:.3}Wh, time: {:.0}ms",
        result.estimated_energy_wh, result.estimated_time_ms
    );

    for (rank, resource) in result.compatible_resources.iter().enumerate() {
        println!(
            "  {}. {} ({}) suitability {:.3}",
            rank + 1,
            resource.resource_id,
            resource.resource_type,
            scanner.suitability_score(resource, protocols)
        );
    }
    for warning in &result.warnings {
        println!("  warning: {}", warning);
    }
    for error in &result.errors {
        println!("  error: {}", error);
    }
}
