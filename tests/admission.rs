use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use tokio::sync::Mutex;

use workshop_signup::admission::AdmissionService;
use workshop_signup::error::{LedgerError, SignupError};
use workshop_signup::ledger::SignupLedger;
use workshop_signup::lock::{AdmissionLocks, KeyedLocks};
use workshop_signup::memory::MemoryLedger;
use workshop_signup::models::{NewSignup, Signup, SignupStatus, Workshop};
use workshop_signup::queue::{Notifier, Outcome, SignupNotification};

type NotifyResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

const CONFERENCE: i32 = 100;

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<SignupNotification>>,
}

impl RecordingNotifier {
    async fn outcomes(&self) -> Vec<(i32, Outcome)> {
        self.sent.lock().await.iter().map(|n| (n.signup_id, n.outcome)).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &SignupNotification) -> NotifyResult {
        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}

struct BrokenNotifier;

#[async_trait]
impl Notifier for BrokenNotifier {
    async fn notify(&self, _notification: &SignupNotification) -> NotifyResult {
        Err("mail relay unreachable".into())
    }
}

struct Harness {
    ledger: Arc<MemoryLedger>,
    locks: Arc<AdmissionLocks>,
    notifier: Arc<RecordingNotifier>,
    service: AdmissionService,
}

async fn harness(workshops: &[(i32, i32)]) -> Harness {
    harness_with(workshops, Duration::from_secs(5)).await
}

async fn harness_with(workshops: &[(i32, i32)], acquire_timeout: Duration) -> Harness {
    let ledger = Arc::new(MemoryLedger::new());
    for &(workshop_id, capacity) in workshops {
        ledger
            .add_workshop(Workshop {
                workshop_id,
                conference_id: CONFERENCE,
                title: format!("Workshop {}", workshop_id),
                capacity,
            })
            .await;
    }
    let locks = Arc::new(AdmissionLocks::Local(KeyedLocks::new(
        acquire_timeout,
        Duration::from_millis(10),
    )));
    let notifier = Arc::new(RecordingNotifier::default());
    let service = AdmissionService::new(ledger.clone(), locks.clone(), notifier.clone());
    Harness { ledger, locks, notifier, service }
}

fn at(minute: i64) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 10, 18)
        .unwrap()
        .and_hms_opt(8, 0, 0)
        .unwrap()
        + chrono::Duration::minutes(minute)
}

fn seeded(workshop_id: i32, user: &str, status: SignupStatus, minute: i64) -> NewSignup {
    NewSignup {
        workshop_id,
        conference_id: CONFERENCE,
        user_id: user.to_string(),
        status,
        created_at: at(minute),
    }
}

fn count(signups: &[Signup], status: SignupStatus) -> usize {
    signups.iter().filter(|s| s.status == status).count()
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

async fn concurrent_signups(service: &AdmissionService, workshop_id: i32, users: usize) -> Vec<Result<SignupStatus, SignupError>> {
    let tasks: Vec<_> = (0..users)
        .map(|i| {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .request_signup(&format!("user-{}", i), workshop_id, CONFERENCE)
                    .await
                    .map(|r| r.status)
            })
        })
        .collect();

    let mut results = Vec::with_capacity(users);
    for task in tasks {
        results.push(task.await.unwrap());
    }
    results
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_racing_signups_for_two_seats_leave_one_on_the_waitlist() {
    let h = harness(&[(1, 2)]).await;

    let results = concurrent_signups(&h.service, 1, 3).await;

    let confirmed = results.iter().filter(|r| matches!(r, Ok(SignupStatus::Confirmed))).count();
    let waitlisted = results.iter().filter(|r| matches!(r, Ok(SignupStatus::Waitlist))).count();
    assert_eq!((confirmed, waitlisted), (2, 1));

    let stored = h.ledger.signups_for(1).await;
    assert_eq!(count(&stored, SignupStatus::Confirmed), 2);
    assert_eq!(count(&stored, SignupStatus::Waitlist), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn confirmed_count_never_exceeds_capacity_under_load() {
    let h = harness(&[(1, 5)]).await;

    let results = concurrent_signups(&h.service, 1, 40).await;
    assert!(results.iter().all(|r| r.is_ok()));

    let stored = h.ledger.signups_for(1).await;
    assert_eq!(stored.len(), 40);
    assert_eq!(count(&stored, SignupStatus::Confirmed), 5);
    assert_eq!(count(&stored, SignupStatus::Waitlist), 35);
    assert_eq!(h.service.capacity(1).await.unwrap().available, 0);
}

#[tokio::test]
async fn second_signup_by_same_user_is_a_duplicate() {
    let h = harness(&[(1, 10)]).await;

    let first = h.service.request_signup("ada", 1, CONFERENCE).await.unwrap();
    assert_eq!(first.status, SignupStatus::Confirmed);

    let second = h.service.request_signup("ada", 1, CONFERENCE).await.unwrap_err();
    assert_eq!(
        second,
        SignupError::DuplicateSignup { user_id: "ada".to_string(), workshop_id: 1 }
    );
    assert_eq!(h.ledger.signups_for(1).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_yield_exactly_one_signup() {
    let h = harness(&[(1, 10)]).await;

    let a = {
        let service = h.service.clone();
        tokio::spawn(async move { service.request_signup("ada", 1, CONFERENCE).await })
    };
    let b = {
        let service = h.service.clone();
        tokio::spawn(async move { service.request_signup("ada", 1, CONFERENCE).await })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(SignupError::DuplicateSignup { .. }))));
    assert_eq!(h.ledger.signups_for(1).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_busy_workshop_does_not_block_another() {
    let h = harness(&[(1, 5), (2, 5)]).await;
    let held = h.locks.acquire(1).await.unwrap();

    let other = tokio::time::timeout(
        Duration::from_secs(1),
        h.service.request_signup("ada", 2, CONFERENCE),
    )
    .await
    .expect("workshop 2 must not wait for workshop 1's lock")
    .unwrap();
    assert_eq!(other.status, SignupStatus::Confirmed);

    let blocked = {
        let service = h.service.clone();
        tokio::spawn(async move { service.request_signup("bob", 1, CONFERENCE).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    h.locks.release(held).await;
    let admitted = blocked.await.unwrap().unwrap();
    assert_eq!(admitted.status, SignupStatus::Confirmed);
}

#[tokio::test]
async fn cancellation_promotes_the_earliest_waitlist_entry() {
    let h = harness(&[(1, 1)]).await;
    let seated = h.ledger.insert_raw(seeded(1, "seated", SignupStatus::Confirmed, 0)).await;
    // inserted out of order so ids disagree with creation time
    let third = h.ledger.insert_raw(seeded(1, "third", SignupStatus::Waitlist, 30)).await;
    let first = h.ledger.insert_raw(seeded(1, "first", SignupStatus::Waitlist, 10)).await;
    let second = h.ledger.insert_raw(seeded(1, "second", SignupStatus::Waitlist, 20)).await;

    h.service
        .cancel_signup(seated.signup_id, Some("travel cancelled".to_string()))
        .await
        .unwrap();

    let status_of = |id: i32| {
        let ledger = h.ledger.clone();
        async move { ledger.get_signup(id).await.unwrap().unwrap().status }
    };
    assert_eq!(status_of(first.signup_id).await, SignupStatus::Confirmed);
    assert_eq!(status_of(second.signup_id).await, SignupStatus::Waitlist);
    assert_eq!(status_of(third.signup_id).await, SignupStatus::Waitlist);
    assert_eq!(status_of(seated.signup_id).await, SignupStatus::Cancelled);
}

#[tokio::test]
async fn failed_write_releases_the_lock() {
    let h = harness_with(&[(1, 3)], Duration::from_millis(200)).await;
    h.ledger.fail_next_write();

    let err = h.service.request_signup("ada", 1, CONFERENCE).await.unwrap_err();
    assert!(matches!(err, SignupError::LedgerWrite(LedgerError::Storage(_))));
    assert!(err.is_transient());
    assert!(h.ledger.signups_for(1).await.is_empty());

    let retry = h.service.request_signup("ada", 1, CONFERENCE).await.unwrap();
    assert_eq!(retry.status, SignupStatus::Confirmed);
}

#[tokio::test]
async fn cancelling_the_only_seat_confirms_the_waitlisted_user() {
    let h = harness(&[(1, 1)]).await;
    let holder = h.service.request_signup("holder", 1, CONFERENCE).await.unwrap();
    let waiting = h.service.request_signup("waiting", 1, CONFERENCE).await.unwrap();
    assert_eq!(holder.status, SignupStatus::Confirmed);
    assert_eq!(waiting.status, SignupStatus::Waitlist);

    let cancelled = h.service.cancel_signup(holder.signup.signup_id, None).await.unwrap();
    assert_eq!(cancelled.status, SignupStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());

    let stored = h.ledger.signups_for(1).await;
    assert_eq!(stored.len(), 2);
    assert_eq!(count(&stored, SignupStatus::Waitlist), 0);
    let promoted = stored.iter().find(|s| s.signup_id == waiting.signup.signup_id).unwrap();
    assert_eq!(promoted.status, SignupStatus::Confirmed);

    let promoted_id = promoted.signup_id;
    let notifier = h.notifier.clone();
    eventually("promotion notice", || {
        let notifier = notifier.clone();
        async move { notifier.outcomes().await.contains(&(promoted_id, Outcome::Promoted)) }
    })
    .await;
}

#[tokio::test]
async fn each_decision_is_notified_and_flagged() {
    let h = harness(&[(1, 1)]).await;
    let confirmed = h.service.request_signup("ada", 1, CONFERENCE).await.unwrap();
    let waitlisted = h.service.request_signup("bob", 1, CONFERENCE).await.unwrap();

    let notifier = h.notifier.clone();
    eventually("two notifications", || {
        let notifier = notifier.clone();
        async move { notifier.outcomes().await.len() == 2 }
    })
    .await;

    let outcomes = h.notifier.outcomes().await;
    assert!(outcomes.contains(&(confirmed.signup.signup_id, Outcome::Confirmed)));
    assert!(outcomes.contains(&(waitlisted.signup.signup_id, Outcome::Waitlist)));

    let ledger = h.ledger.clone();
    eventually("notified flags", || {
        let ledger = ledger.clone();
        async move { ledger.signups_for(1).await.iter().all(|s| s.notified) }
    })
    .await;
}

#[tokio::test]
async fn notification_failure_does_not_fail_the_signup() {
    let ledger = Arc::new(MemoryLedger::new());
    ledger
        .add_workshop(Workshop {
            workshop_id: 1,
            conference_id: CONFERENCE,
            title: "Embedded Rust".to_string(),
            capacity: 1,
        })
        .await;
    let locks = Arc::new(AdmissionLocks::Local(KeyedLocks::new(Duration::from_secs(1), Duration::ZERO)));
    let service = AdmissionService::new(ledger.clone(), locks, Arc::new(BrokenNotifier));

    let result = service.request_signup("ada", 1, CONFERENCE).await.unwrap();
    assert_eq!(result.status, SignupStatus::Confirmed);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stored = ledger.get_signup(result.signup.signup_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SignupStatus::Confirmed);
    assert!(!stored.notified);
}

#[tokio::test]
async fn unknown_workshop_or_wrong_conference_is_rejected() {
    let h = harness(&[(1, 3)]).await;

    assert_eq!(
        h.service.request_signup("ada", 42, CONFERENCE).await.unwrap_err(),
        SignupError::WorkshopNotFound(42)
    );
    assert_eq!(
        h.service.request_signup("ada", 1, CONFERENCE + 1).await.unwrap_err(),
        SignupError::WorkshopNotFound(1)
    );
    assert!(h.ledger.signups_for(1).await.is_empty());
}

#[tokio::test]
async fn cancel_rejects_unknown_and_already_cancelled_signups() {
    let h = harness(&[(1, 3)]).await;
    let signup = h.service.request_signup("ada", 1, CONFERENCE).await.unwrap().signup;

    h.service.cancel_signup(signup.signup_id, None).await.unwrap();
    assert_eq!(
        h.service.cancel_signup(signup.signup_id, None).await.unwrap_err(),
        SignupError::AlreadyCancelled(signup.signup_id)
    );
    assert_eq!(
        h.service.cancel_signup(9_999, None).await.unwrap_err(),
        SignupError::SignupNotFound(9_999)
    );

    // a cancelled signup no longer blocks registering again
    let again = h.service.request_signup("ada", 1, CONFERENCE).await.unwrap();
    assert_eq!(again.status, SignupStatus::Confirmed);
}

#[tokio::test]
async fn cancelling_a_waitlist_entry_promotes_nobody() {
    let h = harness(&[(1, 1)]).await;
    h.service.request_signup("ada", 1, CONFERENCE).await.unwrap();
    let bob = h.service.request_signup("bob", 1, CONFERENCE).await.unwrap().signup;
    let cyd = h.service.request_signup("cyd", 1, CONFERENCE).await.unwrap().signup;

    h.service.cancel_signup(bob.signup_id, Some("changed plans".to_string())).await.unwrap();

    let cyd_now = h.ledger.get_signup(cyd.signup_id).await.unwrap().unwrap();
    assert_eq!(cyd_now.status, SignupStatus::Waitlist);
    let bob_now = h.ledger.get_signup(bob.signup_id).await.unwrap().unwrap();
    assert_eq!(bob_now.cancel_reason.as_deref(), Some("changed plans"));
}

#[tokio::test]
async fn manual_promotion_mode_waits_for_on_seat_freed() {
    let h = harness(&[(1, 1)]).await;
    let service = h.service.clone().with_auto_promote(false);
    let ada = service.request_signup("ada", 1, CONFERENCE).await.unwrap().signup;
    let bob = service.request_signup("bob", 1, CONFERENCE).await.unwrap().signup;

    service.cancel_signup(ada.signup_id, None).await.unwrap();
    let bob_now = h.ledger.get_signup(bob.signup_id).await.unwrap().unwrap();
    assert_eq!(bob_now.status, SignupStatus::Waitlist);

    let promoted = service.on_seat_freed(1).await.unwrap().unwrap();
    assert_eq!(promoted.signup_id, bob.signup_id);
    assert_eq!(promoted.status, SignupStatus::Confirmed);

    // seat is taken again, so a second call is a no-op
    assert!(service.on_seat_freed(1).await.unwrap().is_none());
}

#[tokio::test]
async fn on_seat_freed_rejects_unknown_workshop() {
    let h = harness(&[(1, 2)]).await;

    assert_eq!(
        h.service.on_seat_freed(999).await.unwrap_err(),
        SignupError::WorkshopNotFound(999)
    );
}

#[tokio::test]
async fn on_seat_freed_without_waitlist_is_a_no_op() {
    let h = harness(&[(1, 2)]).await;
    h.service.request_signup("ada", 1, CONFERENCE).await.unwrap();

    assert!(h.service.on_seat_freed(1).await.unwrap().is_none());
    assert_eq!(h.ledger.signups_for(1).await.len(), 1);
}

#[tokio::test]
async fn lock_timeout_surfaces_as_lock_unavailable() {
    let h = harness_with(&[(1, 2)], Duration::from_millis(30)).await;
    let held = h.locks.acquire(1).await.unwrap();

    let err = h.service.request_signup("ada", 1, CONFERENCE).await.unwrap_err();
    assert_eq!(err, SignupError::LockUnavailable { workshop_id: 1 });
    assert!(h.ledger.signups_for(1).await.is_empty());

    h.locks.release(held).await;
    h.service.request_signup("ada", 1, CONFERENCE).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_request_still_completes_its_write() {
    let h = harness(&[(1, 2)]).await;
    let held = h.locks.acquire(1).await.unwrap();

    // caller gives up while the decision is queued on the lock
    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        h.service.request_signup("ada", 1, CONFERENCE),
    )
    .await;
    assert!(abandoned.is_err());
    assert!(h.ledger.signups_for(1).await.is_empty());

    h.locks.release(held).await;

    let ledger = h.ledger.clone();
    eventually("abandoned signup to be written", || {
        let ledger = ledger.clone();
        async move { ledger.find_active_signup("ada", 1).await.unwrap().is_some() }
    })
    .await;

    let next = h.service.request_signup("bob", 1, CONFERENCE).await.unwrap();
    assert_eq!(next.status, SignupStatus::Confirmed);
}
