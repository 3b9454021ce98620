//! Ensure a PostgreSQL database exists and is reachable
//!
//! Connects to the administrative database, creates the target database when
//! the catalog does not list it, then opens a second connection to the target
//! and reads the server version.

pub mod ensure;
pub mod report;
pub mod session;
pub mod settings;
pub mod sql;

pub use ensure::{ensure_database, EnsureError, EnsureOutcome, FailureKind, Provisioning};
pub use report::{ConsoleReporter, ProgressEvent, Reporter};
pub use session::{Connector, CreateOutcome, PgConnector, PgSession, Session};
pub use settings::{ConnectionSettings, SettingsError};
