use crate::error::{CliError, CliResult};
use intentmesh_config::{load_allocator_config, AllocatorConfig};
use intentmesh_types::{AllocationRequest, ResourceCapability};
use log::{debug, info};
use resource_allocator::InMemoryResourceRegistry;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;

/// Registry and configuration loaded for one command run
pub struct CliContext {
    pub config: AllocatorConfig,
    pub registry: Arc<InMemoryResourceRegistry>,
}

impl CliContext {
    /// Load the registry file and an optional TOML config (defaults otherwise)
    pub fn load(registry_path: &Path, config_path: Option<&Path>) -> CliResult<Self> {
        let config = load_config(config_path)?;
        let resources: Vec<ResourceCapability> = read_json(registry_path)?;
        info!(
            "Loaded {} resources from {}",
            resources.len(),
            registry_path.display()
        );

        Ok(Self {
            config,
            registry: Arc::new(InMemoryResourceRegistry::from_resources(resources)),
        })
    }
}

pub fn load_config(path: Option<&Path>) -> CliResult<AllocatorConfig> {
    match path {
        Some(path) => {
            debug!("Loading allocator config from {}", path.display());
            Ok(load_allocator_config(path)?)
        }
        None => Ok(AllocatorConfig::default()),
    }
}

pub fn load_request(path: &Path) -> CliResult<AllocationRequest> {
    read_json(path)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> CliResult<T> {
    let content = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| CliError::Json {
        path: path.to_path_buf(),
        source,
    })
}
