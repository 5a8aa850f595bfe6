use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

// Upper bound for LEASE_TTL_MS; a crashed holder blocks its workshop this long at most.
const MAX_LEASE_TTL_MS: u64 = 60 * 60 * 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has invalid value '{value}': expected {expected}")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerBackend {
    Postgres,
    Memory,
}

/// Which admission lock implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockBackend {
    /// In-process keyed mutex. Single-instance deployments only.
    Local,
    /// Lease rows in the database, shared by every instance.
    Lease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifierBackend {
    Amqp,
    Log,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmqpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub exchange: String,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
            exchange: "workshop.notifications".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub bind_addr: String,
    pub ledger: LedgerBackend,
    /// Required when `ledger` is `Postgres` or the lock is `Lease`.
    pub database_url: Option<String>,
    pub lock: LockBackend,
    pub lock_acquire_timeout: Duration,
    /// How long an idle in-process lock entry survives after release
    pub lock_grace: Duration,
    pub lease_ttl: Duration,
    /// How long a request waits for a pooled database connection.
    pub db_pool_timeout: Duration,
    /// Promote the head of the waitlist as soon as a confirmed signup is cancelled.
    pub auto_promote: bool,
    pub notifier: NotifierBackend,
    pub amqp: AmqpConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(&std::env::vars().collect())
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |name: &str| vars.get(name).map(String::as_str).filter(|v| !v.is_empty());

        let ledger = match get("LEDGER").unwrap_or("postgres") {
            "postgres" => LedgerBackend::Postgres,
            "memory" => LedgerBackend::Memory,
            other => return Err(invalid("LEDGER", other, "postgres or memory")),
        };
        let lock = match get("ADMISSION_LOCK").unwrap_or("local") {
            "local" => LockBackend::Local,
            "lease" => LockBackend::Lease,
            other => return Err(invalid("ADMISSION_LOCK", other, "local or lease")),
        };
        let notifier = match get("NOTIFIER").unwrap_or("amqp") {
            "amqp" => NotifierBackend::Amqp,
            "log" => NotifierBackend::Log,
            other => return Err(invalid("NOTIFIER", other, "amqp or log")),
        };

        let database_url = get("DATABASE_URL").map(str::to_string);
        if database_url.is_none() && (ledger == LedgerBackend::Postgres || lock == LockBackend::Lease) {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let db_pool_timeout = millis(get("DB_POOL_TIMEOUT_MS"), "DB_POOL_TIMEOUT_MS", 5_000)?;
        if db_pool_timeout.is_zero() {
            return Err(invalid("DB_POOL_TIMEOUT_MS", "0", "a positive number of milliseconds"));
        }
        // a lease holder stuck on the pool must not outlive its lease
        let lease_ttl = millis(get("LEASE_TTL_MS"), "LEASE_TTL_MS", 30_000)?;
        if lease_ttl <= db_pool_timeout || lease_ttl > Duration::from_millis(MAX_LEASE_TTL_MS) {
            let value = lease_ttl.as_millis().to_string();
            return Err(invalid("LEASE_TTL_MS", &value, "more than DB_POOL_TIMEOUT_MS and at most 3600000"));
        }

        let defaults = AmqpConfig::default();
        let amqp = AmqpConfig {
            host: get("AMQP_HOST").map_or(defaults.host, str::to_string),
            port: parse_or(get("AMQP_PORT"), "AMQP_PORT", defaults.port, "a port number")?,
            user: get("AMQP_USER").map_or(defaults.user, str::to_string),
            password: get("AMQP_PASSWORD").map_or(defaults.password, str::to_string),
            exchange: get("NOTIFICATION_EXCHANGE").map_or(defaults.exchange, str::to_string),
        };

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or("127.0.0.1:8080").to_string(),
            ledger,
            database_url,
            lock,
            lock_acquire_timeout: millis(get("LOCK_ACQUIRE_TIMEOUT_MS"), "LOCK_ACQUIRE_TIMEOUT_MS", 5_000)?,
            lock_grace: millis(get("LOCK_GRACE_MS"), "LOCK_GRACE_MS", 100)?,
            lease_ttl,
            db_pool_timeout,
            auto_promote: parse_or(get("AUTO_PROMOTE"), "AUTO_PROMOTE", true, "true or false")?,
            notifier,
            amqp,
        })
    }
}

fn invalid(name: &'static str, value: &str, expected: &'static str) -> ConfigError {
    ConfigError::Invalid { name, value: value.to_string(), expected }
}

fn parse_or<T: std::str::FromStr>(
    raw: Option<&str>,
    name: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| invalid(name, value, expected)),
    }
}

fn millis(raw: Option<&str>, name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parse_or(raw, name, default, "milliseconds").map(Duration::from_millis)
}
