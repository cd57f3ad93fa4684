use crate::error::AllocationResult;
use crate::reservation_store::ReservationStore;
use crate::store::{AllocationRecord, AllocationStore};
use chrono::{DateTime, Utc};
use intentmesh_types::ResourceReservation;
use log::warn;
use serde::{Deserialize, Serialize};

/// Serializable copy of allocator state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorSnapshot {
    pub taken_at: DateTime<Utc>,

    pub records: Vec<AllocationRecord>,

    pub reservations: Vec<ResourceReservation>,
}

/// Outcome of loading a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub records: usize,
    pub reservations: usize,
    /// Reservations refused because they collided with state already present
    pub rejected_reservations: Vec<String>,
}

impl AllocatorSnapshot {
    pub async fn capture(
        store: &dyn AllocationStore,
        reservations: &dyn ReservationStore,
    ) -> AllocationResult<Self> {
        Ok(Self {
            taken_at: Utc::now(),
            records: store.list().await?,
            reservations: reservations.all().await?,
        })
    }

    /// Load into empty stores.
    ///
    /// Reservations are re-admitted through the normal overlap check; slot
    /// capacity is not known here, so only exclusivity is enforced.
    pub async fn restore_into(
        &self,
        store: &dyn AllocationStore,
        reservations: &dyn ReservationStore,
    ) -> AllocationResult<RestoreReport> {
        let mut report = RestoreReport::default();

        for record in &self.records {
            store.insert(record.clone()).await?;
            report.records += 1;
        }

        for reservation in &self.reservations {
            match reservations.try_reserve(reservation.clone(), u32::MAX).await {
                Ok(_) => report.reservations += 1,
                Err(e) => {
                    warn!(
                        "Snapshot reservation {} not restored: {}",
                        reservation.reservation_id, e
                    );
                    report
                        .rejected_reservations
                        .push(reservation.reservation_id.clone());
                }
            }
        }

        Ok(report)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
