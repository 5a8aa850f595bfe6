// Every check-then-write for a workshop runs under its lock, in a spawned task
// that owns the lock handle.

use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};

use crate::capacity::{self, Capacity};
use crate::error::{LedgerError, SignupError};
use crate::ledger::SignupLedger;
use crate::lock::{AdmissionLocks, LeaseFence};
use crate::models::{NewSignup, Signup, SignupResult, SignupStatus, StatusFields};
use crate::queue::{Notifier, Outcome, SignupNotification};

#[derive(Clone)]
pub struct AdmissionService {
    ledger: Arc<dyn SignupLedger>,
    locks: Arc<AdmissionLocks>,
    notifier: Arc<dyn Notifier>,
    auto_promote: bool,
}

impl AdmissionService {
    pub fn new(
        ledger: Arc<dyn SignupLedger>,
        locks: Arc<AdmissionLocks>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            ledger,
            locks,
            notifier,
            auto_promote: true,
        }
    }

    /// When disabled, cancelling a confirmed signup leaves the seat free until
    /// [`AdmissionService::on_seat_freed`] is called explicitly.
    pub fn with_auto_promote(mut self, auto_promote: bool) -> Self {
        self.auto_promote = auto_promote;
        self
    }

    pub fn ledger(&self) -> &dyn SignupLedger {
        self.ledger.as_ref()
    }

    pub async fn request_signup(
        &self,
        user_id: &str,
        workshop_id: i32,
        conference_id: i32,
    ) -> Result<SignupResult, SignupError> {
        // Cheap rejections before queueing on the lock; both are repeated under it.
        let workshop = self
            .ledger
            .get_workshop(workshop_id)
            .await
            .map_err(SignupError::LedgerRead)?;
        if !workshop.is_some_and(|w| w.conference_id == conference_id) {
            return Err(SignupError::WorkshopNotFound(workshop_id));
        }
        if self.active_signup(user_id, workshop_id).await?.is_some() {
            return Err(duplicate(user_id, workshop_id));
        }

        let task = self.clone().admit_exclusive(user_id.to_owned(), workshop_id, conference_id);
        let signup = tokio::spawn(task).await??;

        Ok(SignupResult { status: signup.status, signup })
    }

    async fn admit_exclusive(
        self,
        user_id: String,
        workshop_id: i32,
        conference_id: i32,
    ) -> Result<Signup, SignupError> {
        let handle = self.locks.acquire(workshop_id).await?;
        let fence = handle.fence();
        let admitted = self
            .admit_locked(&user_id, workshop_id, conference_id, fence.as_ref())
            .await;
        self.locks.release(handle).await;

        if let Ok(signup) = &admitted {
            match signup.status {
                SignupStatus::Confirmed => self.dispatch(SignupNotification::new(signup, Outcome::Confirmed)),
                SignupStatus::Waitlist => self.dispatch(SignupNotification::new(signup, Outcome::Waitlist)),
                SignupStatus::Cancelled => {}
            }
        }
        admitted
    }

    async fn admit_locked(
        &self,
        user_id: &str,
        workshop_id: i32,
        conference_id: i32,
        fence: Option<&LeaseFence>,
    ) -> Result<Signup, SignupError> {
        if self.active_signup(user_id, workshop_id).await?.is_some() {
            return Err(duplicate(user_id, workshop_id));
        }

        let seats = self.capacity(workshop_id).await?;
        if seats.is_unknown_workshop() {
            return Err(SignupError::WorkshopNotFound(workshop_id));
        }
        let status = if seats.has_free_seat() {
            SignupStatus::Confirmed
        } else {
            SignupStatus::Waitlist
        };

        let record = NewSignup {
            workshop_id,
            conference_id,
            user_id: user_id.to_owned(),
            status,
            created_at: Utc::now().naive_utc(),
        };
        let signup = self.ledger.create_signup(record, fence).await.map_err(|e| match e {
            LedgerError::Conflict => duplicate(user_id, workshop_id),
            other => SignupError::LedgerWrite(other),
        })?;

        info!(
            "Admitted '{}' to workshop {} as {:?} (signup {}, {} of {} seats taken before)",
            user_id, workshop_id, signup.status, signup.signup_id, seats.confirmed_count, seats.capacity
        );
        Ok(signup)
    }

    /// Cancels an active signup. Cancelling a confirmed signup frees its seat,
    /// which is handed to the head of the waitlist when auto-promotion is on.
    pub async fn cancel_signup(&self, signup_id: i32, reason: Option<String>) -> Result<Signup, SignupError> {
        let existing = self
            .ledger
            .get_signup(signup_id)
            .await
            .map_err(SignupError::LedgerRead)?
            .ok_or(SignupError::SignupNotFound(signup_id))?;
        let workshop_id = existing.workshop_id;

        let task = self.clone().cancel_exclusive(workshop_id, signup_id, reason);
        let (cancelled, promoted) = tokio::spawn(task).await??;

        if let Some(promoted) = &promoted {
            info!("Signup {} cancelled; promoted signup {} from the waitlist", signup_id, promoted.signup_id);
        }
        Ok(cancelled)
    }

    async fn cancel_exclusive(
        self,
        workshop_id: i32,
        signup_id: i32,
        reason: Option<String>,
    ) -> Result<(Signup, Option<Signup>), SignupError> {
        let handle = self.locks.acquire(workshop_id).await?;
        let fence = handle.fence();
        let outcome = self.cancel_locked(signup_id, reason, fence.as_ref()).await;
        self.locks.release(handle).await;

        if let Ok((_, Some(promoted))) = &outcome {
            self.dispatch(SignupNotification::new(promoted, Outcome::Promoted));
        }
        outcome
    }

    async fn cancel_locked(
        &self,
        signup_id: i32,
        reason: Option<String>,
        fence: Option<&LeaseFence>,
    ) -> Result<(Signup, Option<Signup>), SignupError> {
        // re-read under the lock, a concurrent cancel may have won
        let current = self
            .ledger
            .get_signup(signup_id)
            .await
            .map_err(SignupError::LedgerRead)?
            .ok_or(SignupError::SignupNotFound(signup_id))?;
        if !current.status.can_transition_to(SignupStatus::Cancelled) {
            return Err(SignupError::AlreadyCancelled(signup_id));
        }

        let fields = StatusFields {
            cancelled_at: Some(Utc::now().naive_utc()),
            cancel_reason: reason,
        };
        let cancelled = self
            .ledger
            .update_status(signup_id, SignupStatus::Cancelled, fields, fence)
            .await
            .map_err(SignupError::LedgerWrite)?;

        if current.status != SignupStatus::Confirmed || !self.auto_promote {
            return Ok((cancelled, None));
        }

        // The cancellation is already durable; a failed promotion must not report it as failed.
        match self.promote_locked(current.workshop_id, fence).await {
            Ok(promoted) => Ok((cancelled, promoted)),
            Err(e) => {
                error!("Promotion after cancelling signup {} failed: {}", signup_id, e);
                Ok((cancelled, None))
            }
        }
    }

    /// Fills a freed seat from the waitlist. Returns the promoted signup, or `None`
    /// when there is no free seat or nobody is waiting.
    /// Fails with [`SignupError::WorkshopNotFound`] for an unknown workshop.
    pub async fn on_seat_freed(&self, workshop_id: i32) -> Result<Option<Signup>, SignupError> {
        tokio::spawn(self.clone().promote_exclusive(workshop_id)).await?
    }

    async fn promote_exclusive(self, workshop_id: i32) -> Result<Option<Signup>, SignupError> {
        let handle = self.locks.acquire(workshop_id).await?;
        let fence = handle.fence();
        let promoted = self.promote_locked(workshop_id, fence.as_ref()).await;
        self.locks.release(handle).await;

        if let Ok(Some(signup)) = &promoted {
            self.dispatch(SignupNotification::new(signup, Outcome::Promoted));
        }
        promoted
    }

    async fn promote_locked(
        &self,
        workshop_id: i32,
        fence: Option<&LeaseFence>,
    ) -> Result<Option<Signup>, SignupError> {
        let seats = self.capacity(workshop_id).await?;
        if seats.is_unknown_workshop() {
            return Err(SignupError::WorkshopNotFound(workshop_id));
        }
        if !seats.has_free_seat() {
            info!("No free seat in workshop {} - skipping waitlist promotion", workshop_id);
            return Ok(None);
        }

        let Some(next) = self
            .ledger
            .next_waitlisted(workshop_id)
            .await
            .map_err(SignupError::LedgerRead)?
        else {
            info!("Waitlist for workshop {} is empty", workshop_id);
            return Ok(None);
        };

        let promoted = self
            .ledger
            .update_status(next.signup_id, SignupStatus::Confirmed, StatusFields::default(), fence)
            .await
            .map_err(SignupError::LedgerWrite)?;

        info!(
            "Promoted signup {} ('{}') in workshop {} from the waitlist",
            promoted.signup_id, promoted.user_id, workshop_id
        );
        Ok(Some(promoted))
    }

    /// Unlocked snapshot; fine for display, never for deciding admission.
    pub async fn capacity(&self, workshop_id: i32) -> Result<Capacity, SignupError> {
        capacity::snapshot(self.ledger.as_ref(), workshop_id)
            .await
            .map_err(SignupError::LedgerRead)
    }

    async fn active_signup(&self, user_id: &str, workshop_id: i32) -> Result<Option<Signup>, SignupError> {
        self.ledger
            .find_active_signup(user_id, workshop_id)
            .await
            .map_err(SignupError::LedgerRead)
    }

    fn dispatch(&self, notification: SignupNotification) {
        let notifier = Arc::clone(&self.notifier);
        let ledger = Arc::clone(&self.ledger);
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&notification).await {
                error!(
                    "Failed to notify '{}' about signup {} ({:?}): {:?}",
                    notification.user_id, notification.signup_id, notification.outcome, e
                );
                return;
            }
            if let Err(e) = ledger.mark_notified(notification.signup_id).await {
                warn!("Could not flag signup {} as notified: {}", notification.signup_id, e);
            }
        });
    }
}

fn duplicate(user_id: &str, workshop_id: i32) -> SignupError {
    SignupError::DuplicateSignup {
        user_id: user_id.to_owned(),
        workshop_id,
    }
}
