// In-process ledger for tests and LEDGER=memory runs. Mirrors the partial unique
// index on active signups.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::LedgerError;
use crate::ledger::{Result, SignupLedger};
use crate::lock::LeaseFence;
use crate::models::{NewSignup, Signup, SignupStatus, StatusFields, Workshop};

#[derive(Default)]
struct Tables {
    workshops: HashMap<i32, Workshop>,
    signups: BTreeMap<i32, Signup>,
    next_signup_id: i32,
}

#[derive(Default)]
pub struct MemoryLedger {
    tables: Mutex<Tables>,
    fail_next_write: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_workshop(&self, workshop: Workshop) {
        self.tables.lock().await.workshops.insert(workshop.workshop_id, workshop);
    }

    /// Seeds a signup exactly as given, bypassing admission. Returns it with its new id.
    pub async fn insert_raw(&self, record: NewSignup) -> Signup {
        let mut tables = self.tables.lock().await;
        tables.next_signup_id += 1;
        let signup = Signup {
            signup_id: tables.next_signup_id,
            workshop_id: record.workshop_id,
            conference_id: record.conference_id,
            user_id: record.user_id,
            status: record.status,
            created_at: record.created_at,
            cancelled_at: None,
            cancel_reason: None,
            notified: false,
        };
        tables.signups.insert(signup.signup_id, signup.clone());
        signup
    }

    /// Makes the next `create_signup` or `update_status` fail with a storage error.
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    pub async fn signups_for(&self, workshop_id: i32) -> Vec<Signup> {
        self.tables
            .lock()
            .await
            .signups
            .values()
            .filter(|s| s.workshop_id == workshop_id)
            .cloned()
            .collect()
    }

    fn take_injected_failure(&self) -> Result<()> {
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::Storage("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SignupLedger for MemoryLedger {
    async fn get_workshop(&self, workshop_id: i32) -> Result<Option<Workshop>> {
        tokio::task::yield_now().await;
        Ok(self.tables.lock().await.workshops.get(&workshop_id).cloned())
    }

    async fn get_signup(&self, signup_id: i32) -> Result<Option<Signup>> {
        tokio::task::yield_now().await;
        Ok(self.tables.lock().await.signups.get(&signup_id).cloned())
    }

    async fn find_active_signup(&self, user_id: &str, workshop_id: i32) -> Result<Option<Signup>> {
        tokio::task::yield_now().await;
        let tables = self.tables.lock().await;
        Ok(tables
            .signups
            .values()
            .find(|s| s.user_id == user_id && s.workshop_id == workshop_id && s.status.is_active())
            .cloned())
    }

    async fn count_confirmed(&self, workshop_id: i32) -> Result<i64> {
        tokio::task::yield_now().await;
        let tables = self.tables.lock().await;
        let count = tables
            .signups
            .values()
            .filter(|s| s.workshop_id == workshop_id && s.status == SignupStatus::Confirmed)
            .count();
        Ok(count as i64)
    }

    // Fences are ignored: nothing outside this process can write here.
    async fn create_signup(&self, record: NewSignup, _fence: Option<&LeaseFence>) -> Result<Signup> {
        tokio::task::yield_now().await;
        self.take_injected_failure()?;

        let mut tables = self.tables.lock().await;
        let clash = tables.signups.values().any(|s| {
            s.user_id == record.user_id && s.workshop_id == record.workshop_id && s.status.is_active()
        });
        if clash && record.status.is_active() {
            return Err(LedgerError::Conflict);
        }

        tables.next_signup_id += 1;
        let signup = Signup {
            signup_id: tables.next_signup_id,
            workshop_id: record.workshop_id,
            conference_id: record.conference_id,
            user_id: record.user_id,
            status: record.status,
            created_at: record.created_at,
            cancelled_at: None,
            cancel_reason: None,
            notified: false,
        };
        tables.signups.insert(signup.signup_id, signup.clone());
        Ok(signup)
    }

    async fn update_status(
        &self,
        signup_id: i32,
        new_status: SignupStatus,
        fields: StatusFields,
        _fence: Option<&LeaseFence>,
    ) -> Result<Signup> {
        tokio::task::yield_now().await;
        self.take_injected_failure()?;

        let mut tables = self.tables.lock().await;
        let signup = tables.signups.get_mut(&signup_id).ok_or(LedgerError::NotFound)?;
        signup.status = new_status;
        signup.cancelled_at = fields.cancelled_at;
        signup.cancel_reason = fields.cancel_reason;
        Ok(signup.clone())
    }

    async fn next_waitlisted(&self, workshop_id: i32) -> Result<Option<Signup>> {
        tokio::task::yield_now().await;
        let tables = self.tables.lock().await;
        Ok(tables
            .signups
            .values()
            .filter(|s| s.workshop_id == workshop_id && s.status == SignupStatus::Waitlist)
            .min_by_key(|s| (s.created_at, s.signup_id))
            .cloned())
    }

    async fn mark_notified(&self, signup_id: i32) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let signup = tables.signups.get_mut(&signup_id).ok_or(LedgerError::NotFound)?;
        signup.notified = true;
        Ok(())
    }
}
