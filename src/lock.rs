// Per-workshop admission lock. `Local` is only correct for a single instance,
// `Lease` works across instances sharing the database.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, error, warn};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use uuid::Uuid;

use crate::actions;
use crate::error::{LedgerError, SignupError};
use crate::ledger::DbPool;

type LockTable = DashMap<i32, Arc<Mutex<()>>>;

pub enum AdmissionLocks {
    Local(KeyedLocks),
    Lease(LeaseLocks),
}

impl AdmissionLocks {
    pub async fn acquire(&self, workshop_id: i32) -> Result<LockHandle, SignupError> {
        match self {
            AdmissionLocks::Local(locks) => locks.acquire(workshop_id).await.map(LockHandle::Local),
            AdmissionLocks::Lease(locks) => locks.acquire(workshop_id).await.map(LockHandle::Lease),
        }
    }

    pub async fn release(&self, handle: LockHandle) {
        match handle {
            LockHandle::Local(guard) => drop(guard),
            LockHandle::Lease(lease) => lease.release().await,
        }
    }
}

pub enum LockHandle {
    Local(LocalGuard),
    Lease(Lease),
}

impl LockHandle {
    pub fn workshop_id(&self) -> i32 {
        match self {
            LockHandle::Local(guard) => guard.workshop_id,
            LockHandle::Lease(lease) => lease.workshop_id,
        }
    }

    /// Writes made while holding a lease must carry its fence. In-process guards
    /// cannot be lost, so they have none.
    pub fn fence(&self) -> Option<LeaseFence> {
        match self {
            LockHandle::Local(_) => None,
            LockHandle::Lease(lease) => Some(lease.fence()),
        }
    }
}

pub struct KeyedLocks {
    table: Arc<LockTable>,
    acquire_timeout: Duration,
    grace: Duration,
}

impl KeyedLocks {
    pub fn new(acquire_timeout: Duration, grace: Duration) -> Self {
        Self {
            table: Arc::new(DashMap::new()),
            acquire_timeout,
            grace,
        }
    }

    pub async fn acquire(&self, workshop_id: i32) -> Result<LocalGuard, SignupError> {
        let mutex = {
            let entry = self
                .table
                .entry(workshop_id)
                .or_insert_with(|| Arc::new(Mutex::new(())));
            Arc::clone(entry.value())
        };

        let acquired = tokio::time::timeout(self.acquire_timeout, mutex.lock_owned()).await;
        match acquired {
            Ok(guard) => Ok(LocalGuard {
                workshop_id,
                guard: Some(guard),
                table: Arc::clone(&self.table),
                grace: self.grace,
            }),
            Err(_) => {
                warn!("Timed out after {:?} waiting for admission lock of workshop {}", self.acquire_timeout, workshop_id);
                evict_if_idle(&self.table, workshop_id);
                Err(SignupError::LockUnavailable { workshop_id })
            }
        }
    }

    /// Number of workshops that currently have a lock-table entry.
    pub fn tracked(&self) -> usize {
        self.table.len()
    }
}

// Holders and waiters each keep a clone of the Arc; the table's own copy is the last one.
fn evict_if_idle(table: &LockTable, workshop_id: i32) {
    if table.remove_if(&workshop_id, |_, m| Arc::strong_count(m) == 1).is_some() {
        debug!("Dropped idle admission lock for workshop {}", workshop_id);
    }
}

pub struct LocalGuard {
    workshop_id: i32,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<LockTable>,
    grace: Duration,
}

impl Drop for LocalGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        let table = Arc::clone(&self.table);
        let workshop_id = self.workshop_id;
        if self.grace.is_zero() {
            evict_if_idle(&table, workshop_id);
            return;
        }

        // keep the entry around briefly so a burst of requests reuses it
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let grace = self.grace;
                runtime.spawn(async move {
                    tokio::time::sleep(grace).await;
                    evict_if_idle(&table, workshop_id);
                });
            }
            Err(_) => evict_if_idle(&table, workshop_id),
        }
    }
}

pub struct LeaseLocks {
    pool: DbPool,
    ttl: Duration,
    acquire_timeout: Duration,
}

impl LeaseLocks {
    pub fn new(pool: DbPool, ttl: Duration, acquire_timeout: Duration) -> Self {
        Self { pool, ttl, acquire_timeout }
    }

    pub async fn acquire(&self, workshop_id: i32) -> Result<Lease, SignupError> {
        let holder = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.acquire_timeout;
        let mut delay = Duration::from_millis(25);

        loop {
            match self.try_take(workshop_id, &holder).await {
                Ok(true) => {
                    debug!("Took admission lease {} for workshop {}", holder, workshop_id);
                    return Ok(Lease {
                        workshop_id,
                        holder,
                        pool: self.pool.clone(),
                        released: false,
                    })
                }
                Ok(false) => {}
                Err(e) => {
                    error!("Lease provider unavailable for workshop {}: {}", workshop_id, e);
                    return Err(SignupError::LockUnavailable { workshop_id });
                }
            }

            if Instant::now() + delay >= deadline {
                warn!("Timed out after {:?} waiting for admission lease of workshop {}", self.acquire_timeout, workshop_id);
                return Err(SignupError::LockUnavailable { workshop_id });
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(500));
        }
    }

    async fn try_take(&self, workshop_id: i32, holder: &str) -> Result<bool, LedgerError> {
        let pool = self.pool.clone();
        let holder = holder.to_owned();
        let ttl = self.ttl;
        tokio::task::spawn_blocking(move || -> Result<bool, LedgerError> {
            let mut conn = pool.get()?;
            Ok(actions::try_acquire_lease(&mut conn, workshop_id, &holder, ttl)?)
        })
        .await?
    }
}

/// Identifies a lease so that writes made under it can be rejected once it has
/// expired or been taken over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseFence {
    pub workshop_id: i32,
    pub holder: String,
}

pub struct Lease {
    workshop_id: i32,
    holder: String,
    pool: DbPool,
    released: bool,
}

impl Lease {
    pub fn fence(&self) -> LeaseFence {
        LeaseFence {
            workshop_id: self.workshop_id,
            holder: self.holder.clone(),
        }
    }

    pub async fn release(mut self) {
        self.released = true;
        let pool = self.pool.clone();
        let workshop_id = self.workshop_id;
        let holder = self.holder.clone();
        let outcome = tokio::task::spawn_blocking(move || delete_lease(&pool, workshop_id, &holder)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Could not release lease for workshop {} (expires on its own): {}", workshop_id, e),
            Err(e) => warn!("Lease release task for workshop {} failed: {}", workshop_id, e),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let pool = self.pool.clone();
        let workshop_id = self.workshop_id;
        let holder = std::mem::take(&mut self.holder);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn_blocking(move || {
                if let Err(e) = delete_lease(&pool, workshop_id, &holder) {
                    warn!("Could not release dropped lease for workshop {}: {}", workshop_id, e);
                }
            });
        }
    }
}

fn delete_lease(pool: &DbPool, workshop_id: i32, holder: &str) -> Result<(), LedgerError> {
    let mut conn = pool.get()?;
    if !actions::release_lease(&mut conn, workshop_id, holder)? {
        warn!("Lease for workshop {} was already taken over before release", workshop_id);
    }
    Ok(())
}
