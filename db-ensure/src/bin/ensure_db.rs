//! Ensure the configured database exists, then verify it by querying the
//! server version.
//!
//! Settings come from `PGHOST`, `PGPORT`, `PGUSER`, `PGPASSWORD`,
//! `ENSURE_DB_NAME`, `ENSURE_DB_ADMIN_DATABASE`,
//! `ENSURE_DB_CONNECT_TIMEOUT_SECS` and the optional YAML file named by
//! `ENSURE_DB_CONFIG`.
//!
//! Exits 1 on any failure, after printing the `❌ Error:` line, so scripts
//! can tell a failed run from a successful one.

use common::init_logging;
use db_ensure::{
    ensure_database, ConnectionSettings, ConsoleReporter, PgConnector, ProgressEvent, Reporter,
};
use tracing::{error, info, Level};

#[tokio::main]
async fn main() {
    let _guard = init_logging("ensure-db", Level::WARN);
    let reporter = ConsoleReporter;

    let settings = match ConnectionSettings::from_env() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to load settings");
            reporter.report(&ProgressEvent::Failed {
                error: format!("{:#}", e),
            });
            std::process::exit(1);
        }
    };

    info!(settings = ?settings, "Settings loaded");

    // Failures are already reported by the routine
    if ensure_database(&PgConnector, &settings, &reporter)
        .await
        .is_err()
    {
        std::process::exit(1);
    }
}
