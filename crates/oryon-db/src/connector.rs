//! Private-path connector for managed database instances.
//!
//! An instance is addressed by its connection name (`project:region:instance`)
//! and reached through the instance mount that the platform exposes inside
//! the private network, at `<socket_dir>/<instance connection name>/`. The
//! connector never builds a public address: it is constructed with an
//! [`IpType`] and refuses anything but [`IpType::Private`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use r2d2::ManageConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use serde::Deserialize;

use crate::error::DbError;

/// Default directory under which instance mounts appear.
pub const DEFAULT_SOCKET_DIR: &str = "/cloudsql";

/// Raw connection settings as read from configuration.
///
/// Every field the connector needs is optional here; [`ConnectionConfig::validate`]
/// turns them into a [`ConnectionTarget`] or reports what is missing.
#[derive(Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Instance connection name, `project:region:instance`.
    #[serde(default)]
    pub instance_connection_name: Option<String>,

    /// Database user.
    #[serde(default)]
    pub user: Option<String>,

    /// Database password. Never logged.
    #[serde(default)]
    pub password: Option<String>,

    /// Database name within the instance.
    #[serde(default)]
    pub name: Option<String>,

    /// Directory holding the instance mounts.
    #[serde(default = "default_socket_dir")]
    pub socket_dir: String,
}

fn default_socket_dir() -> String {
    DEFAULT_SOCKET_DIR.to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            instance_connection_name: None,
            user: None,
            password: None,
            name: None,
            socket_dir: default_socket_dir(),
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("instance_connection_name", &self.instance_connection_name)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("name", &self.name)
            .field("socket_dir", &self.socket_dir)
            .finish()
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl ConnectionConfig {
    /// Whether an instance connection name has been supplied at all.
    pub fn has_instance(&self) -> bool {
        present(&self.instance_connection_name).is_some()
    }

    /// Validates the settings and resolves the connection target.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Configuration` listing every required field that is
    /// missing or blank, or describing a malformed instance connection name.
    pub fn validate(&self) -> Result<ConnectionTarget, DbError> {
        let instance = present(&self.instance_connection_name);
        let user = present(&self.user);
        let password = present(&self.password);
        let name = present(&self.name);

        let missing: Vec<&str> = [
            ("instance_connection_name", instance.is_none()),
            ("user", user.is_none()),
            ("password", password.is_none()),
            ("name", name.is_none()),
        ]
        .into_iter()
        .filter_map(|(field, absent)| absent.then_some(field))
        .collect();

        let (Some(instance), Some(user), Some(_), Some(name)) = (instance, user, password, name)
        else {
            return Err(DbError::Configuration(format!(
                "missing {}",
                missing.join(", ")
            )));
        };

        if !is_path_safe(name) {
            return Err(DbError::Configuration(format!(
                "database name '{name}' contains characters outside [A-Za-z0-9_-]"
            )));
        }

        Ok(ConnectionTarget {
            instance: instance.parse()?,
            user: user.to_string(),
            database: name.to_string(),
            socket_dir: PathBuf::from(&self.socket_dir),
        })
    }
}

fn is_path_safe(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// A parsed `project:region:instance` identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConnectionName {
    project: String,
    region: String,
    instance: String,
}

impl InstanceConnectionName {
    /// The project component.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// The region component.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// The instance component.
    pub fn instance(&self) -> &str {
        &self.instance
    }
}

impl FromStr for InstanceConnectionName {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [project, region, instance]
                if [project, region, instance].iter().all(|p| is_path_safe(p)) =>
            {
                Ok(Self {
                    project: project.to_string(),
                    region: region.to_string(),
                    instance: instance.to_string(),
                })
            }
            _ => Err(DbError::Configuration(format!(
                "instance connection name '{s}' is not of the form project:region:instance"
            ))),
        }
    }
}

impl fmt::Display for InstanceConnectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.project, self.region, self.instance)
    }
}

/// A validated set of connection settings.
///
/// The password is checked for presence during validation and not retained:
/// access to the instance mount is what authorizes the connection.
#[derive(Debug, Clone)]
pub struct ConnectionTarget {
    instance: InstanceConnectionName,
    user: String,
    database: String,
    socket_dir: PathBuf,
}

impl ConnectionTarget {
    /// The instance this target points at.
    pub fn instance(&self) -> &InstanceConnectionName {
        &self.instance
    }

    /// The connecting user.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The database name.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Directory of the instance mount.
    pub fn mount(&self) -> PathBuf {
        self.socket_dir.join(self.instance.to_string())
    }

    /// Path of the database inside the instance mount.
    pub fn endpoint(&self) -> PathBuf {
        self.mount().join(format!("{}.db", self.database))
    }
}

/// Network path used to reach an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IpType {
    /// Through the private network only.
    #[default]
    Private,
    /// Through a public address.
    Public,
}

/// An `r2d2` connection manager that opens every physical connection
/// through the instance's private mount.
pub struct InstanceConnector {
    target: ConnectionTarget,
    mount: PathBuf,
    manager: SqliteConnectionManager,
}

impl InstanceConnector {
    /// Creates a connector for `target`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Configuration` if `ip_type` is anything other than
    /// [`IpType::Private`].
    pub fn new(
        target: ConnectionTarget,
        ip_type: IpType,
        busy_timeout_ms: u64,
    ) -> Result<Self, DbError> {
        if ip_type != IpType::Private {
            return Err(DbError::Configuration(format!(
                "instance {} requested a {:?} IP path; only private connections are allowed",
                target.instance(),
                ip_type
            )));
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let manager = SqliteConnectionManager::file(target.endpoint())
            .with_flags(flags)
            .with_init(move |conn| {
                let journal_mode: String =
                    conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
                if journal_mode != "wal" {
                    return Err(rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                        Some(format!(
                            "failed to set WAL journal mode, got: {}",
                            journal_mode
                        )),
                    ));
                }
                conn.execute_batch(&format!("PRAGMA busy_timeout = {};", busy_timeout_ms))
            });

        Ok(Self {
            mount: target.mount(),
            target,
            manager,
        })
    }

    /// The target this connector resolves.
    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    /// Path of the instance mount.
    pub fn mount(&self) -> &Path {
        &self.mount
    }
}

impl fmt::Debug for InstanceConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceConnector")
            .field("target", &self.target)
            .field("mount", &self.mount)
            .finish_non_exhaustive()
    }
}

impl ManageConnection for InstanceConnector {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        // Opening with SQLITE_OPEN_CREATE against a missing mount would
        // fail with a generic message; report the unreachable instance.
        if !self.mount.is_dir() {
            return Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                Some(format!(
                    "instance {} is not reachable at {}",
                    self.target.instance(),
                    self.mount.display()
                )),
            ));
        }

        tracing::debug!(
            instance = %self.target.instance(),
            database = self.target.database(),
            user = self.target.user(),
            "opening private connection"
        );
        self.manager.connect()
    }

    fn is_valid(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        self.manager.is_valid(conn)
    }

    fn has_broken(&self, conn: &mut Connection) -> bool {
        self.manager.has_broken(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_config(socket_dir: &str) -> ConnectionConfig {
        ConnectionConfig {
            instance_connection_name: Some("oryon-dev:us-central1:main-db".to_string()),
            user: Some("app".to_string()),
            password: Some("s3cret".to_string()),
            name: Some("oryon".to_string()),
            socket_dir: socket_dir.to_string(),
        }
    }

    #[test]
    fn validate_reports_every_missing_field() {
        let config = ConnectionConfig {
            user: Some("app".to_string()),
            password: Some("   ".to_string()),
            ..ConnectionConfig::default()
        };

        let err = config.validate().expect_err("incomplete config must fail");
        match err {
            DbError::Configuration(msg) => {
                assert!(msg.contains("instance_connection_name"), "{msg}");
                assert!(msg.contains("password"), "blank counts as missing: {msg}");
                assert!(msg.contains("name"), "{msg}");
                assert!(!msg.contains("user"), "user was supplied: {msg}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn validate_resolves_endpoint_under_mount() {
        let target = complete_config("/cloudsql").validate().expect("valid config");
        assert_eq!(target.instance().project(), "oryon-dev");
        assert_eq!(target.instance().region(), "us-central1");
        assert_eq!(target.instance().instance(), "main-db");
        assert_eq!(
            target.endpoint(),
            PathBuf::from("/cloudsql/oryon-dev:us-central1:main-db/oryon.db")
        );
    }

    #[test]
    fn malformed_instance_names_are_rejected() {
        for bad in ["main-db", "a:b", "a:b:c:d", "a::c", "../x:y:z", "a:b:c/d"] {
            assert!(
                bad.parse::<InstanceConnectionName>().is_err(),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn database_name_cannot_escape_mount() {
        let mut config = complete_config("/cloudsql");
        config.name = Some("../other".to_string());
        assert!(matches!(config.validate(), Err(DbError::Configuration(_))));
    }

    #[test]
    fn public_ip_type_is_refused() {
        let target = complete_config("/cloudsql").validate().expect("valid config");
        let err = InstanceConnector::new(target, IpType::Public, 1_000)
            .expect_err("public path must be refused");
        assert!(matches!(err, DbError::Configuration(_)));
    }

    #[test]
    fn connect_fails_when_mount_is_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = complete_config(dir.path().to_str().expect("utf-8 path"))
            .validate()
            .expect("valid config");
        let connector = InstanceConnector::new(target, IpType::Private, 1_000).expect("connector");

        let err = connector.connect().expect_err("mount does not exist yet");
        assert!(err.to_string().contains("not reachable"), "{err}");
    }

    #[test]
    fn connect_opens_wal_database_inside_mount() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = complete_config(dir.path().to_str().expect("utf-8 path"))
            .validate()
            .expect("valid config");
        std::fs::create_dir_all(target.mount()).expect("create mount");
        let connector = InstanceConnector::new(target, IpType::Private, 2_500).expect("connector");

        let mut conn = connector.connect().expect("connect through mount");
        connector.is_valid(&mut conn).expect("connection should be valid");

        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .expect("journal_mode");
        assert_eq!(mode, "wal");

        let busy: i64 = conn
            .query_row("PRAGMA busy_timeout;", [], |row| row.get(0))
            .expect("busy_timeout");
        assert_eq!(busy, 2_500);
        assert!(connector.target().endpoint().exists());
    }

    #[test]
    fn debug_output_redacts_password() {
        let rendered = format!("{:?}", complete_config("/cloudsql"));
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }
}
