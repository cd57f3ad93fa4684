use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Registry, TextEncoder,
};

/// Prometheus metrics for one allocator instance
#[derive(Clone)]
pub struct AllocatorTelemetry {
    registry: Registry,

    /// Allocation attempts by outcome (reserved, failed, cancelled)
    pub allocations: IntCounterVec,

    /// Rebinding attempts by outcome
    pub rebinds: IntCounterVec,

    /// Dispatch attempts by outcome
    pub dispatches: IntCounterVec,

    /// Reservation attempts refused because the resource was taken
    pub reservation_conflicts: IntCounter,

    /// Wall time of the binding phase, by outcome
    pub binding_latency: HistogramVec,
}

impl AllocatorTelemetry {
    /// Create metrics on a private registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics and register them on `registry`
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let allocations = IntCounterVec::new(
            prometheus::opts!("intentmesh_allocations_total", "Allocation attempts by outcome"),
            &["outcome"],
        )?;
        let rebinds = IntCounterVec::new(
            prometheus::opts!("intentmesh_rebinds_total", "Rebinding attempts by outcome"),
            &["outcome"],
        )?;
        let dispatches = IntCounterVec::new(
            prometheus::opts!("intentmesh_dispatch_total", "Dispatch attempts by outcome"),
            &["outcome"],
        )?;
        let reservation_conflicts = IntCounter::new(
            "intentmesh_reservation_conflicts_total",
            "Reservation attempts refused by an overlapping hold",
        )?;
        let binding_latency = HistogramVec::new(
            HistogramOpts::new(
                "intentmesh_binding_latency_seconds",
                "Time spent taking reservations for an allocation",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["outcome"],
        )?;

        registry.register(Box::new(allocations.clone()))?;
        registry.register(Box::new(rebinds.clone()))?;
        registry.register(Box::new(dispatches.clone()))?;
        registry.register(Box::new(reservation_conflicts.clone()))?;
        registry.register(Box::new(binding_latency.clone()))?;

        Ok(Self {
            registry,
            allocations,
            rebinds,
            dispatches,
            reservation_conflicts,
            binding_latency,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_allocation(&self, outcome: &str) {
        self.allocations.with_label_values(&[outcome]).inc();
    }

    pub fn record_rebind(&self, outcome: &str) {
        self.rebinds.with_label_values(&[outcome]).inc();
    }

    pub fn record_dispatch(&self, outcome: &str) {
        self.dispatches.with_label_values(&[outcome]).inc();
    }

    pub fn record_binding(&self, outcome: &str, seconds: f64) {
        self.binding_latency
            .with_label_values(&[outcome])
            .observe(seconds);
    }

    /// Render all metrics in the Prometheus text format
    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            log::warn!("Failed to encode allocator metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
