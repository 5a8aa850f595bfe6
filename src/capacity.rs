use serde::Serialize;

use crate::ledger::{Result, SignupLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capacity {
    pub capacity: i64,
    pub confirmed_count: i64,
    /// `capacity - confirmed_count`; zero or negative means no free seat.
    pub available: i64,
}

impl Capacity {
    /// Zeroed snapshot returned for an unknown workshop.
    pub const NOT_FOUND: Capacity = Capacity { capacity: 0, confirmed_count: 0, available: 0 };

    pub fn new(capacity: i64, confirmed_count: i64) -> Self {
        Self { capacity, confirmed_count, available: capacity - confirmed_count }
    }

    pub fn has_free_seat(&self) -> bool {
        self.available > 0
    }

    /// Real workshops always have a positive capacity.
    pub fn is_unknown_workshop(&self) -> bool {
        self.capacity <= 0
    }
}

/// Reads capacity and confirmed count straight from the ledger. Nothing is cached:
/// admission callers must hold the workshop's lock for the result to stay valid.
pub async fn snapshot(ledger: &dyn SignupLedger, workshop_id: i32) -> Result<Capacity> {
    let Some(capacity) = ledger.get_workshop_capacity(workshop_id).await? else {
        return Ok(Capacity::NOT_FOUND);
    };
    let confirmed = ledger.count_confirmed(workshop_id).await?;
    Ok(Capacity::new(i64::from(capacity), confirmed))
}
