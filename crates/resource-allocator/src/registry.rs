use async_trait::async_trait;
use intentmesh_types::{PowerState, ResourceCapability};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors reported by a resource registry
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("malformed resource record {resource_id}: {reason}")]
    Malformed { resource_id: String, reason: String },
}

/// Source of current resource state.
///
/// Implementations must return live power, load and network state; the
/// allocator never caches the result beyond one scan.
#[async_trait]
pub trait ResourceRegistry: Send + Sync {
    /// Every known resource
    async fn get_all_devices(&self) -> Result<Vec<ResourceCapability>, RegistryError>;

    /// One resource by id
    async fn get_device_capabilities(
        &self,
        resource_id: &str,
    ) -> Result<Option<ResourceCapability>, RegistryError>;
}

/// Registry held in memory, ordered by resource id
pub struct InMemoryResourceRegistry {
    resources: RwLock<BTreeMap<String, ResourceCapability>>,
}

impl InMemoryResourceRegistry {
    pub fn new() -> Self {
        Self {
            resources: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a registry pre-populated with resources
    pub fn from_resources(resources: impl IntoIterator<Item = ResourceCapability>) -> Self {
        let map = resources
            .into_iter()
            .map(|r| (r.resource_id.clone(), r))
            .collect();
        Self {
            resources: RwLock::new(map),
        }
    }

    /// Insert or replace a resource
    pub async fn upsert(&self, resource: ResourceCapability) {
        let mut resources = self.resources.write().await;
        resources.insert(resource.resource_id.clone(), resource);
    }

    pub async fn remove(&self, resource_id: &str) -> Option<ResourceCapability> {
        let mut resources = self.resources.write().await;
        resources.remove(resource_id)
    }

    /// Apply an in-place update to one resource; false if it is unknown
    pub async fn update<F>(&self, resource_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut ResourceCapability),
    {
        let mut resources = self.resources.write().await;
        match resources.get_mut(resource_id) {
            Some(resource) => {
                f(resource);
                resource.last_heartbeat = chrono::Utc::now();
                true
            }
            None => false,
        }
    }

    pub async fn set_power_state(&self, resource_id: &str, power_state: PowerState) -> bool {
        self.update(resource_id, |r| r.power_state = power_state).await
    }

    pub async fn len(&self) -> usize {
        self.resources.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.resources.read().await.is_empty()
    }
}

impl Default for InMemoryResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceRegistry for InMemoryResourceRegistry {
    async fn get_all_devices(&self) -> Result<Vec<ResourceCapability>, RegistryError> {
        let resources = self.resources.read().await;
        Ok(resources.values().cloned().collect())
    }

    async fn get_device_capabilities(
        &self,
        resource_id: &str,
    ) -> Result<Option<ResourceCapability>, RegistryError> {
        let resources = self.resources.read().await;
        Ok(resources.get(resource_id).cloned())
    }
}
