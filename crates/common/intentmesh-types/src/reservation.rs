use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Time-window claim on one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReservation {
    /// Reservation identifier
    pub reservation_id: String,

    /// Allocation that owns the reservation
    pub allocation_id: String,

    /// Reserved resource
    pub resource_id: String,

    /// Step the reservation serves
    pub step_id: String,

    /// Start of the reserved window (inclusive)
    pub start_time: DateTime<Utc>,

    /// End of the reserved window (exclusive)
    pub end_time: DateTime<Utc>,

    /// Request priority (1-100)
    pub priority: u8,

    /// Exclusive reservations never share their window with any other reservation
    pub exclusive: bool,

    pub created_at: DateTime<Utc>,

    /// Dispatch must consume the reservation before this instant or it expires
    pub consume_by: DateTime<Utc>,

    /// Set once the allocation has been handed to the executor
    #[serde(default)]
    pub consumed: bool,
}

impl ResourceReservation {
    /// Whether the two reservations claim the same resource over intersecting windows
    pub fn overlaps(&self, other: &ResourceReservation) -> bool {
        self.resource_id == other.resource_id
            && self.overlaps_window(other.start_time, other.end_time)
    }

    /// Whether this reservation's window intersects `[start, end)`
    pub fn overlaps_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start_time < end && start < self.end_time
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.consumed && now >= self.consume_by
    }

    pub fn duration_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds()
    }
}
