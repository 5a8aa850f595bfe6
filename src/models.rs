use serde::{Deserialize, Serialize};
use crate::schema::{signups, workshops};
use chrono::NaiveDateTime;
use diesel::{deserialize::{self, FromSql}, pg::{Pg, PgValue}, serialize::{self, Output, ToSql}, sql_types::Text, Insertable, Queryable, Selectable};

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = workshops)]
pub struct Workshop {
    pub workshop_id: i32,
    pub conference_id: i32,
    pub title: String,
    pub capacity: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = crate::schema::sql_types::SignupStatus)]
#[serde(rename_all = "lowercase")]
pub enum SignupStatus {
    Confirmed,
    Waitlist,
    Cancelled,
}

impl SignupStatus {
    /// Confirmed and waitlisted signups both hold the user's one registration slot.
    pub fn is_active(self) -> bool {
        matches!(self, SignupStatus::Confirmed | SignupStatus::Waitlist)
    }

    pub fn can_transition_to(self, next: SignupStatus) -> bool {
        matches!(
            (self, next),
            (SignupStatus::Confirmed, SignupStatus::Cancelled)
                | (SignupStatus::Waitlist, SignupStatus::Cancelled)
                | (SignupStatus::Waitlist, SignupStatus::Confirmed)
        )
    }
}

impl ToSql<crate::schema::sql_types::SignupStatus, Pg> for SignupStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        let s = match *self {
            SignupStatus::Confirmed => "CONFIRMED",
            SignupStatus::Waitlist => "WAITLIST",
            SignupStatus::Cancelled => "CANCELLED",
        };
        <str as ToSql<Text, Pg>>::to_sql(s, out)
    }
}

impl FromSql<crate::schema::sql_types::SignupStatus, Pg> for SignupStatus {
    fn from_sql(bytes: PgValue) -> deserialize::Result<Self> {
        match <String as FromSql<Text, Pg>>::from_sql(bytes)?.as_str() {
            "CONFIRMED" => Ok(SignupStatus::Confirmed),
            "WAITLIST" => Ok(SignupStatus::Waitlist),
            "CANCELLED" => Ok(SignupStatus::Cancelled),
            s => Err(format!("Unrecognized signup status: {}", s).into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = signups)]
pub struct Signup {
    pub signup_id: i32,
    pub workshop_id: i32,
    pub conference_id: i32,
    pub user_id: String,
    pub status: SignupStatus,
    pub created_at: NaiveDateTime,
    pub cancelled_at: Option<NaiveDateTime>,
    pub cancel_reason: Option<String>,
    pub notified: bool,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = signups)]
pub struct NewSignup {
    pub workshop_id: i32,
    pub conference_id: i32,
    pub user_id: String,
    pub status: SignupStatus,
    pub created_at: NaiveDateTime,
}

/// Timestamp and reason columns patched together with a status change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusFields {
    pub cancelled_at: Option<NaiveDateTime>,
    pub cancel_reason: Option<String>,
}

/// What the admission engine decided for a signup request.
#[derive(Debug, Clone, Serialize)]
pub struct SignupResult {
    pub status: SignupStatus,
    pub signup: Signup,
}

// Request/Response models for API
#[derive(Debug, Deserialize, Clone)]
pub struct SignupRequest {
    pub user_id: String,
    pub workshop_id: i32,
    pub conference_id: i32,
}

#[derive(Debug, Serialize)]
pub struct SignupResponse {
    pub signup_id: i32,
    pub status: SignupStatus,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub signup_id: i32,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub message: String,
}
