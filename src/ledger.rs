use async_trait::async_trait;
use diesel::{
    prelude::*,
    r2d2::{ConnectionManager, Pool},
};

use crate::actions;
use std::time::Duration;

use crate::error::LedgerError;
use crate::lock::LeaseFence;
use crate::models::{NewSignup, Signup, SignupStatus, StatusFields, Workshop};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;
pub type Result<T> = std::result::Result<T, LedgerError>;

#[async_trait]
pub trait SignupLedger: Send + Sync {
    async fn get_workshop(&self, workshop_id: i32) -> Result<Option<Workshop>>;

    async fn get_workshop_capacity(&self, workshop_id: i32) -> Result<Option<i32>> {
        Ok(self.get_workshop(workshop_id).await?.map(|w| w.capacity))
    }

    async fn get_signup(&self, signup_id: i32) -> Result<Option<Signup>>;

    /// The user's confirmed or waitlisted signup for this workshop, if any.
    async fn find_active_signup(&self, user_id: &str, workshop_id: i32) -> Result<Option<Signup>>;

    async fn count_confirmed(&self, workshop_id: i32) -> Result<i64>;

    /// Atomic insert. Fails with [`LedgerError::Conflict`] when the user already
    /// holds an active signup for the workshop, and with [`LedgerError::LeaseLost`]
    /// when `fence` names a lease that is no longer held.
    async fn create_signup(&self, record: NewSignup, fence: Option<&LeaseFence>) -> Result<Signup>;

    async fn update_status(
        &self,
        signup_id: i32,
        new_status: SignupStatus,
        fields: StatusFields,
        fence: Option<&LeaseFence>,
    ) -> Result<Signup>;

    /// Earliest-created waitlist signup, lowest id first on equal timestamps.
    async fn next_waitlisted(&self, workshop_id: i32) -> Result<Option<Signup>>;

    async fn mark_notified(&self, signup_id: i32) -> Result<()>;
}

#[derive(Clone)]
pub struct PgLedger {
    pool: DbPool,
}

impl PgLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    // diesel is synchronous, keep it off the async workers
    async fn run<T, F>(&self, query: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> std::result::Result<T, diesel::result::Error> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<T> {
            let mut conn = pool.get()?;
            query(&mut conn).map_err(LedgerError::from)
        })
        .await?
    }

    // Lease check and write commit together; the share lock holds off any takeover
    async fn run_fenced<T, F>(&self, fence: Option<&LeaseFence>, query: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> std::result::Result<T, diesel::result::Error> + Send + 'static,
    {
        let Some(fence) = fence.cloned() else {
            return self.run(query).await;
        };
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<T> {
            let mut pooled = pool.get()?;
            let conn: &mut PgConnection = &mut pooled;
            conn.transaction::<T, LedgerError, _>(|conn| {
                if !actions::lease_is_held(conn, fence.workshop_id, &fence.holder)? {
                    return Err(LedgerError::LeaseLost(fence.workshop_id));
                }
                Ok(query(conn)?)
            })
        })
        .await?
    }
}

#[async_trait]
impl SignupLedger for PgLedger {
    async fn get_workshop(&self, workshop_id: i32) -> Result<Option<Workshop>> {
        self.run(move |conn| actions::get_workshop(conn, workshop_id)).await
    }

    async fn get_signup(&self, signup_id: i32) -> Result<Option<Signup>> {
        self.run(move |conn| actions::get_signup(conn, signup_id)).await
    }

    async fn find_active_signup(&self, user_id: &str, workshop_id: i32) -> Result<Option<Signup>> {
        let user_id = user_id.to_owned();
        self.run(move |conn| actions::find_active_signup(conn, &user_id, workshop_id)).await
    }

    async fn count_confirmed(&self, workshop_id: i32) -> Result<i64> {
        self.run(move |conn| actions::count_confirmed(conn, workshop_id)).await
    }

    async fn create_signup(&self, record: NewSignup, fence: Option<&LeaseFence>) -> Result<Signup> {
        self.run_fenced(fence, move |conn| actions::create_signup(conn, &record)).await
    }

    async fn update_status(
        &self,
        signup_id: i32,
        new_status: SignupStatus,
        fields: StatusFields,
        fence: Option<&LeaseFence>,
    ) -> Result<Signup> {
        self.run_fenced(fence, move |conn| actions::update_status(conn, signup_id, new_status, &fields))
            .await
    }

    async fn next_waitlisted(&self, workshop_id: i32) -> Result<Option<Signup>> {
        self.run(move |conn| actions::next_waitlisted(conn, workshop_id)).await
    }

    async fn mark_notified(&self, signup_id: i32) -> Result<()> {
        self.run(move |conn| actions::mark_notified(conn, signup_id)).await
    }
}

/// `connection_timeout` must stay below the lease TTL, or a holder waiting on the
/// pool could outlive its lease.
pub fn initialize_db_pool(
    database_url: &str,
    connection_timeout: Duration,
) -> std::result::Result<DbPool, r2d2::Error> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder().connection_timeout(connection_timeout).build(manager)
}
