use diesel::prelude::*;
use diesel::sql_types::{Double, Integer, Varchar};
use std::time::Duration;
use crate::models::{self, SignupStatus};

type DbError = diesel::result::Error;

pub fn get_workshop(conn: &mut PgConnection, id: i32) -> Result<Option<models::Workshop>, DbError> {
    use crate::schema::workshops::dsl::workshops;

    workshops
        .find(id)
        .select(models::Workshop::as_select())
        .first(conn)
        .optional()
}

pub fn get_signup(conn: &mut PgConnection, id: i32) -> Result<Option<models::Signup>, DbError> {
    use crate::schema::signups::dsl::signups;

    signups
        .find(id)
        .select(models::Signup::as_select())
        .first(conn)
        .optional()
}

pub fn find_active_signup(
    conn: &mut PgConnection,
    uid: &str,
    wid: i32
) -> Result<Option<models::Signup>, DbError> {
    use crate::schema::signups::dsl::{signups, user_id, workshop_id, status};

    signups
        .filter(user_id.eq(uid))
        .filter(workshop_id.eq(wid))
        .filter(status.eq_any(vec![SignupStatus::Confirmed, SignupStatus::Waitlist]))
        .select(models::Signup::as_select())
        .first(conn)
        .optional()
}

pub fn count_confirmed(conn: &mut PgConnection, wid: i32) -> Result<i64, DbError> {
    use crate::schema::signups::dsl::{signups, workshop_id, status};

    signups
        .filter(workshop_id.eq(wid))
        .filter(status.eq(SignupStatus::Confirmed))
        .count()
        .get_result(conn)
}

// Single INSERT .. RETURNING; the partial unique index rejects a second active signup.
pub fn create_signup(conn: &mut PgConnection, record: &models::NewSignup) -> Result<models::Signup, DbError> {
    use crate::schema::signups::dsl::signups;

    diesel::insert_into(signups)
        .values(record)
        .returning(models::Signup::as_returning())
        .get_result(conn)
}

pub fn update_status(
    conn: &mut PgConnection,
    id: i32,
    new_status: SignupStatus,
    fields: &models::StatusFields
) -> Result<models::Signup, DbError> {
    use crate::schema::signups::dsl::{signups, status, cancelled_at, cancel_reason};

    diesel::update(signups.find(id))
        .set((
            status.eq(new_status),
            cancelled_at.eq(fields.cancelled_at),
            cancel_reason.eq(fields.cancel_reason.as_deref()),
        ))
        .returning(models::Signup::as_returning())
        .get_result(conn)
}

pub fn next_waitlisted(conn: &mut PgConnection, wid: i32) -> Result<Option<models::Signup>, DbError> {
    use crate::schema::signups::dsl::{signups, workshop_id, status, created_at, signup_id};

    signups
        .filter(workshop_id.eq(wid))
        .filter(status.eq(SignupStatus::Waitlist))
        .order((created_at.asc(), signup_id.asc()))
        .select(models::Signup::as_select())
        .first(conn)
        .optional()
}

pub fn mark_notified(conn: &mut PgConnection, id: i32) -> Result<(), DbError> {
    use crate::schema::signups::dsl::{signups, notified};

    let updated = diesel::update(signups.find(id))
        .set(notified.eq(true))
        .execute(conn)?;

    if updated == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Takes the lease for a workshop if nobody holds it or the current lease has expired.
/// Returns whether `holder` now owns it. Expiry is computed and checked on the database
/// clock so instances with skewed clocks agree on it.
pub fn try_acquire_lease(
    conn: &mut PgConnection,
    wid: i32,
    holder: &str,
    ttl: Duration
) -> Result<bool, DbError> {
    let taken = diesel::sql_query(
        "INSERT INTO admission_leases (workshop_id, holder, expires_at) \
         VALUES ($1, $2, now() + make_interval(secs => $3)) \
         ON CONFLICT (workshop_id) DO UPDATE \
         SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at \
         WHERE admission_leases.expires_at < now()",
    )
    .bind::<Integer, _>(wid)
    .bind::<Varchar, _>(holder)
    .bind::<Double, _>(ttl.as_secs_f64())
    .execute(conn)?;

    Ok(taken == 1)
}

/// Whether `lease_holder` still owns an unexpired lease on the workshop. Inside a
/// transaction the row stays share-locked, so no takeover can commit before it ends.
pub fn lease_is_held(conn: &mut PgConnection, wid: i32, lease_holder: &str) -> Result<bool, DbError> {
    use crate::schema::admission_leases::dsl::{admission_leases, workshop_id, holder, expires_at};

    admission_leases
        .filter(workshop_id.eq(wid))
        .filter(holder.eq(lease_holder))
        .filter(expires_at.gt(diesel::dsl::now))
        .select(workshop_id)
        .for_share()
        .first::<i32>(conn)
        .optional()
        .map(|held| held.is_some())
}

pub fn release_lease(conn: &mut PgConnection, wid: i32, lease_holder: &str) -> Result<bool, DbError> {
    use crate::schema::admission_leases::dsl::{admission_leases, workshop_id, holder};

    let deleted = diesel::delete(
        admission_leases
            .filter(workshop_id.eq(wid))
            .filter(holder.eq(lease_holder))
    )
    .execute(conn)?;

    Ok(deleted > 0)
}
