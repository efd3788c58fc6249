//! Database layer for the OryonTech sample service.
//!
//! Owns the connection pool (via `r2d2`), the private-path connector that
//! opens every physical connection, the embedded schema migrations, and the
//! queries against the health-check log.
//!
//! # Design decisions
//!
//! - **`r2d2` connection pool**: bounded reuse with internal locking; callers
//!   never share a connection, and a checked-out connection goes back to the
//!   pool when its handle is dropped.
//! - **Private connector**: connections are only ever opened through the
//!   instance mount. There is no public-address fallback.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!` and tracked, so schema setup is idempotent.

mod connector;
mod error;
pub mod health_checks;
mod migrations;
mod pool;

pub use connector::{
    ConnectionConfig, ConnectionTarget, InstanceConnectionName, InstanceConnector, IpType,
    DEFAULT_SOCKET_DIR,
};
pub use error::DbError;
pub use health_checks::{HealthCheckRecord, HealthCheckSummary};
pub use migrations::{run_migrations, MigrationError};
pub use pool::{Database, DbPool, PoolPolicy, PoolStatus, ScopedConnection};
