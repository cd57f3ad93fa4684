use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Battery level reported by mains-powered resources
pub const MAINS_POWERED: f64 = 1.0;

/// Kind of concrete resource a step can be bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Smart-home device (lights, locks, plugs)
    Device,
    /// Compute node at the edge (home hub, gateway, edge box)
    EdgeCompute,
    /// Compute node in a cloud region
    CloudCompute,
    /// Network appliance (router, mesh node)
    Network,
    /// Storage target (NAS, object store)
    Storage,
    /// Sensor producing readings
    Sensor,
    /// Actuator driving a physical change
    Actuator,
}

impl ResourceType {
    /// Whether the resource is a piece of local hardware in the home
    pub fn is_local_hardware(&self) -> bool {
        matches!(self, ResourceType::Device | ResourceType::Sensor | ResourceType::Actuator)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Device => "device",
            ResourceType::EdgeCompute => "edge_compute",
            ResourceType::CloudCompute => "cloud_compute",
            ResourceType::Network => "network",
            ResourceType::Storage => "storage",
            ResourceType::Sensor => "sensor",
            ResourceType::Actuator => "actuator",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Power state reported by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Online,
    Standby,
    Sleeping,
    Offline,
    Unknown,
}

/// Transport or application protocol a resource speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Zigbee,
    ZWave,
    Matter,
    Thread,
    Wifi,
    Bluetooth,
    Ethernet,
    Mqtt,
    Http,
    Coap,
    Grpc,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Zigbee => "zigbee",
            Protocol::ZWave => "z_wave",
            Protocol::Matter => "matter",
            Protocol::Thread => "thread",
            Protocol::Wifi => "wifi",
            Protocol::Bluetooth => "bluetooth",
            Protocol::Ethernet => "ethernet",
            Protocol::Mqtt => "mqtt",
            Protocol::Http => "http",
            Protocol::Coap => "coap",
            Protocol::Grpc => "grpc",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time description of one concrete resource.
///
/// Snapshots are refreshed from the registry on every feasibility scan and
/// are never mutated by the allocator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceCapability {
    /// Registry identifier of the resource
    pub resource_id: String,

    /// Kind of resource
    pub resource_type: ResourceType,

    /// Capability tags (e.g. "light", "thermostat", "gpu")
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Protocols the resource can be reached over
    #[serde(default)]
    pub protocols: Vec<Protocol>,

    /// Current power state
    pub power_state: PowerState,

    /// Battery level in [0, 1]; 1.0 for mains-powered resources
    #[serde(default = "default_battery_level")]
    pub battery_level: f64,

    /// Network quality in [0, 1]
    pub network_quality: f64,

    /// Available bandwidth in Mbps
    pub bandwidth_mbps: f64,

    /// Round-trip latency in milliseconds
    pub latency_ms: f64,

    /// Cost of running on this resource in dollars per hour
    #[serde(default)]
    pub cost_per_hour: f64,

    /// Free concurrency slots
    pub available_slots: u32,

    /// Current load fraction in [0, 1]
    #[serde(default)]
    pub current_load: f64,

    /// Optional location label (room, site or region)
    #[serde(default)]
    pub location: Option<String>,

    /// Last heartbeat received by the registry
    #[serde(default = "Utc::now")]
    pub last_heartbeat: DateTime<Utc>,
}

fn default_battery_level() -> f64 {
    MAINS_POWERED
}

impl ResourceCapability {
    /// Create an online, idle, mains-powered resource with one free slot
    pub fn new(resource_id: impl Into<String>, resource_type: ResourceType) -> Self {
        Self {
            resource_id: resource_id.into(),
            resource_type,
            capabilities: Vec::new(),
            protocols: Vec::new(),
            power_state: PowerState::Online,
            battery_level: MAINS_POWERED,
            network_quality: 1.0,
            bandwidth_mbps: 100.0,
            latency_ms: 10.0,
            cost_per_hour: 0.0,
            available_slots: 1,
            current_load: 0.0,
            location: None,
            last_heartbeat: Utc::now(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_protocols(mut self, protocols: &[Protocol]) -> Self {
        self.protocols.extend_from_slice(protocols);
        self
    }

    pub fn with_power_state(mut self, power_state: PowerState) -> Self {
        self.power_state = power_state;
        self
    }

    pub fn with_battery_level(mut self, battery_level: f64) -> Self {
        self.battery_level = battery_level;
        self
    }

    /// Set network quality, bandwidth and latency in one go
    pub fn with_network(mut self, quality: f64, bandwidth_mbps: f64, latency_ms: f64) -> Self {
        self.network_quality = quality;
        self.bandwidth_mbps = bandwidth_mbps;
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_cost_per_hour(mut self, cost_per_hour: f64) -> Self {
        self.cost_per_hour = cost_per_hour;
        self
    }

    pub fn with_slots(mut self, available_slots: u32) -> Self {
        self.available_slots = available_slots;
        self
    }

    pub fn with_load(mut self, current_load: f64) -> Self {
        self.current_load = current_load;
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Check whether the resource advertises a capability tag
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Check whether the resource speaks at least one of the given protocols
    pub fn supports_any(&self, protocols: &[Protocol]) -> bool {
        protocols.iter().any(|p| self.protocols.contains(p))
    }

    /// Fraction of the given protocols this resource supports.
    ///
    /// An empty requirement is fully matched.
    pub fn protocol_match_fraction(&self, protocols: &[Protocol]) -> f64 {
        if protocols.is_empty() {
            return 1.0;
        }
        let matched = protocols.iter().filter(|p| self.protocols.contains(p)).count();
        matched as f64 / protocols.len() as f64
    }

    pub fn is_mains_powered(&self) -> bool {
        self.battery_level >= MAINS_POWERED
    }
}
