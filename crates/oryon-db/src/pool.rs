//! Connection pool creation and scoped acquisition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use r2d2::{HandleError, Pool, PooledConnection};
use serde::Serialize;

use crate::connector::{ConnectionConfig, InstanceConnector, IpType};
use crate::error::DbError;
use crate::migrations::run_migrations;

/// Sizing and lifetime policy for the connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolPolicy {
    /// Connections kept open while idle.
    pub pool_size: u32,

    /// Extra connections allowed beyond `pool_size` under load.
    pub max_overflow: u32,

    /// How long an acquirer waits for a free connection.
    pub acquire_timeout: Duration,

    /// Age after which a connection is closed and replaced.
    pub recycle_after: Duration,

    /// Idle time after which connections above `pool_size` are closed.
    pub overflow_idle_timeout: Duration,

    /// Busy timeout for SQLite connections, in milliseconds.
    pub busy_timeout_ms: u64,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            pool_size: 5,
            max_overflow: 2,
            acquire_timeout: Duration::from_secs(30),
            recycle_after: Duration::from_secs(1800),
            overflow_idle_timeout: Duration::from_secs(60),
            busy_timeout_ms: 5_000,
        }
    }
}

impl PoolPolicy {
    /// Upper bound on concurrently checked-out connections.
    pub fn max_connections(&self) -> u32 {
        self.pool_size + self.max_overflow
    }

    fn check(&self) -> Result<(), DbError> {
        if self.pool_size == 0 {
            return Err(DbError::Configuration("pool_size must be positive".into()));
        }
        for (field, value) in [
            ("acquire_timeout", self.acquire_timeout),
            ("recycle_after", self.recycle_after),
            ("overflow_idle_timeout", self.overflow_idle_timeout),
        ] {
            if value.is_zero() {
                return Err(DbError::Configuration(format!("{field} must be non-zero")));
            }
        }
        Ok(())
    }
}

/// The underlying `r2d2` pool type.
pub type DbPool = Pool<InstanceConnector>;

/// A borrowed connection. Dropping it returns the connection to the pool.
pub type ScopedConnection = PooledConnection<InstanceConnector>;

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Physical connections currently open.
    pub connections: u32,
    /// Open connections not checked out.
    pub idle: u32,
    /// Connections checked out by callers.
    pub in_use: u32,
    /// Upper bound on open connections.
    pub max: u32,
}

/// Routes `r2d2` background connection failures into `tracing`.
#[derive(Debug)]
struct TracingErrorHandler;

impl HandleError<rusqlite::Error> for TracingErrorHandler {
    fn handle_error(&self, error: rusqlite::Error) {
        tracing::warn!(error = %error, "database connection attempt failed");
    }
}

/// Whether the schema has been brought up to date on this pool.
#[derive(Debug, Default)]
struct SchemaState {
    ready: AtomicBool,
    // Serializes migration runs so concurrent first acquirers don't race.
    lock: Mutex<()>,
}

/// Owner of the connection pool.
///
/// Cloning is cheap; clones share the same pool and schema state.
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
    policy: PoolPolicy,
    schema: Arc<SchemaState>,
}

impl Database {
    /// Validates `config` and builds the pool.
    ///
    /// The pool is built without waiting for connections, so an unreachable
    /// instance does not block startup; failures show up on [`Database::acquire`].
    ///
    /// # Errors
    ///
    /// Returns `DbError::Configuration` when required settings are missing or
    /// the policy is unusable.
    pub fn initialize(config: &ConnectionConfig, policy: PoolPolicy) -> Result<Self, DbError> {
        policy.check()?;
        let target = config.validate()?;

        tracing::info!(
            instance = %target.instance(),
            database = target.database(),
            pool_size = policy.pool_size,
            max_overflow = policy.max_overflow,
            "initializing database connection pool"
        );

        let connector = InstanceConnector::new(target, IpType::Private, policy.busy_timeout_ms)?;

        let pool = Pool::builder()
            .max_size(policy.max_connections())
            .min_idle(Some(policy.pool_size))
            .connection_timeout(policy.acquire_timeout)
            .max_lifetime(Some(policy.recycle_after))
            .idle_timeout(Some(policy.overflow_idle_timeout))
            .test_on_check_out(true)
            .error_handler(Box::new(TracingErrorHandler))
            .build_unchecked(connector);

        tracing::info!("database connection pool initialized");
        Ok(Self {
            pool,
            policy,
            schema: Arc::new(SchemaState::default()),
        })
    }

    /// The policy this pool was built with.
    pub fn policy(&self) -> PoolPolicy {
        self.policy
    }

    /// Borrows a connection, waiting up to the acquisition timeout.
    ///
    /// If the schema has not been set up yet (the instance was unreachable
    /// at startup), it is set up on this connection before it is returned.
    ///
    /// # Errors
    ///
    /// Returns `DbError::PoolExhausted` when every connection stayed checked
    /// out for the whole timeout, `DbError::Connection` when a new
    /// connection could not be opened, or `DbError::Migration` when the
    /// pending schema setup fails.
    pub fn acquire(&self) -> Result<ScopedConnection, DbError> {
        let conn = self.checkout()?;
        if !self.schema_ready() {
            self.migrate(&conn)?;
        }
        Ok(conn)
    }

    /// Whether schema setup has completed on this pool.
    pub fn schema_ready(&self) -> bool {
        self.schema.ready.load(Ordering::Acquire)
    }

    fn checkout(&self) -> Result<ScopedConnection, DbError> {
        self.pool.get().map_err(|e| self.classify_checkout_failure(e))
    }

    fn migrate(&self, conn: &rusqlite::Connection) -> Result<usize, DbError> {
        let _guard = self
            .schema
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.schema_ready() {
            return Ok(0);
        }

        let applied = run_migrations(conn)?;
        self.schema.ready.store(true, Ordering::Release);
        if applied > 0 {
            tracing::info!(count = applied, "database schema initialized");
        } else {
            tracing::debug!("database schema already up to date");
        }
        Ok(applied)
    }

    fn classify_checkout_failure(&self, err: r2d2::Error) -> DbError {
        let state = self.pool.state();
        if state.connections >= self.pool.max_size() && state.idle_connections == 0 {
            tracing::warn!(
                max = self.pool.max_size(),
                "all pooled connections are checked out"
            );
            DbError::PoolExhausted(self.policy.acquire_timeout)
        } else {
            DbError::Connection(err.to_string())
        }
    }

    /// Creates the schema if it is absent. Safe to call repeatedly.
    ///
    /// Returns the number of migrations applied by this call. A failure here
    /// is not final: the next successful [`Database::acquire`] retries it.
    ///
    /// # Errors
    ///
    /// Returns a connection error if no connection can be acquired, or
    /// `DbError::Migration` if a statement fails.
    pub fn ensure_schema(&self) -> Result<usize, DbError> {
        let conn = self.checkout()?;
        self.migrate(&conn)
    }

    /// Current pool occupancy.
    pub fn status(&self) -> PoolStatus {
        let state = self.pool.state();
        PoolStatus {
            connections: state.connections,
            idle: state.idle_connections,
            in_use: state.connections - state.idle_connections,
            max: self.pool.max_size(),
        }
    }
}
