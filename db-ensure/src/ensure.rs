//! Ensure a database exists, then verify it is reachable
//!
//! The routine runs connect, lookup, create-if-absent, reconnect and version
//! query in that order and stops at the first failure. A database created
//! before a later step fails is left in place.

use std::error::Error as StdError;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::report::{ProgressEvent, Reporter};
use crate::session::{Connector, CreateOutcome, Session};
use crate::settings::{ConnectionSettings, SettingsError};

/// How the target database came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioning {
    Created,
    AlreadyExisted,
    /// Lookup found nothing, but the server rejected creation as a duplicate
    CreatedConcurrently,
}

/// Result of a successful run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsureOutcome {
    pub database: String,
    pub provisioning: Provisioning,
    pub server_version: String,
}

/// Step at which a run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Config,
    Connect,
    Lookup,
    Create,
    Verify,
}

#[derive(Debug, Error)]
pub enum EnsureError {
    #[error("invalid settings")]
    InvalidConfig(#[from] SettingsError),

    #[error("could not connect to administrative database '{database}'")]
    Connect {
        database: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("could not check whether database '{database}' exists")]
    Lookup {
        database: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("could not create database '{database}'")]
    Create {
        database: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("could not verify database '{database}'")]
    Verify {
        database: String,
        #[source]
        source: anyhow::Error,
    },
}

impl EnsureError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidConfig(_) => FailureKind::Config,
            Self::Connect { .. } => FailureKind::Connect,
            Self::Lookup { .. } => FailureKind::Lookup,
            Self::Create { .. } => FailureKind::Create,
            Self::Verify { .. } => FailureKind::Verify,
        }
    }

    /// The error and all of its causes on one line
    pub fn describe(&self) -> String {
        let mut out = self.to_string();
        let mut source = self.source();
        while let Some(cause) = source {
            out.push_str(": ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}

/// Make sure `settings.database` exists and answers a version query.
///
/// Progress goes to `reporter`, including a final `Failed` event when the
/// run stops early. At most one session is open at a time and every session
/// is released before this returns, whatever the outcome.
#[instrument(skip_all, fields(database = %settings.database))]
pub async fn ensure_database<C: Connector>(
    connector: &C,
    settings: &ConnectionSettings,
    reporter: &dyn Reporter,
) -> Result<EnsureOutcome, EnsureError> {
    let start = Instant::now();
    let result = run(connector, settings, reporter).await;

    match &result {
        Ok(outcome) => {
            info!(
                provisioning = ?outcome.provisioning,
                duration_ms = start.elapsed().as_millis() as u64,
                "Database ready"
            );
        }
        Err(e) => {
            // The reporter prints the failure; keep stderr quiet at the default level
            debug!(kind = ?e.kind(), error = %e.describe(), "Ensure failed");
            reporter.report(&ProgressEvent::Failed { error: e.describe() });
        }
    }

    result
}

async fn run<C: Connector>(
    connector: &C,
    settings: &ConnectionSettings,
    reporter: &dyn Reporter,
) -> Result<EnsureOutcome, EnsureError> {
    settings.validate()?;
    let database = settings.database.as_str();

    reporter.report(&ProgressEvent::ConnectingAdmin {
        admin_database: settings.admin_database.clone(),
    });
    let admin = connector
        .connect(settings, &settings.admin_database)
        .await
        .map_err(|source| EnsureError::Connect {
            database: settings.admin_database.clone(),
            source,
        })?;

    let provisioned = provision(&admin, database, reporter).await;
    release(admin).await;
    let provisioning = provisioned?;

    reporter.report(&ProgressEvent::TestingConnection {
        database: database.to_string(),
    });
    let verify_failed = |source| EnsureError::Verify {
        database: database.to_string(),
        source,
    };
    let target = connector
        .connect(settings, database)
        .await
        .map_err(verify_failed)?;

    let version = target.server_version().await;
    release(target).await;
    let server_version = version.map_err(verify_failed)?;

    reporter.report(&ProgressEvent::Connected {
        database: database.to_string(),
    });
    reporter.report(&ProgressEvent::ServerVersion {
        version: server_version.clone(),
    });

    Ok(EnsureOutcome {
        database: database.to_string(),
        provisioning,
        server_version,
    })
}

async fn provision<S: Session>(
    admin: &S,
    database: &str,
    reporter: &dyn Reporter,
) -> Result<Provisioning, EnsureError> {
    let exists = admin
        .database_exists(database)
        .await
        .map_err(|source| EnsureError::Lookup {
            database: database.to_string(),
            source,
        })?;

    if exists {
        reporter.report(&ProgressEvent::AlreadyExists {
            database: database.to_string(),
        });
        return Ok(Provisioning::AlreadyExisted);
    }

    reporter.report(&ProgressEvent::Creating {
        database: database.to_string(),
    });
    let created = match admin.create_database(database).await {
        Ok(created) => created,
        // A concurrent create can surface as an unrecognised error
        Err(source) => match admin.database_exists(database).await {
            Ok(true) => {
                debug!(error = %source, "Create failed but the database exists now");
                CreateOutcome::AlreadyExisted
            }
            _ => {
                return Err(EnsureError::Create {
                    database: database.to_string(),
                    source,
                })
            }
        },
    };

    match created {
        CreateOutcome::Created => {
            reporter.report(&ProgressEvent::Created {
                database: database.to_string(),
            });
            Ok(Provisioning::Created)
        }
        CreateOutcome::AlreadyExisted => {
            reporter.report(&ProgressEvent::CreatedConcurrently {
                database: database.to_string(),
            });
            Ok(Provisioning::CreatedConcurrently)
        }
    }
}

/// Close a session. Close errors are logged and never change the outcome.
async fn release<S: Session>(session: S) {
    let database = session.database().to_string();
    if let Err(e) = session.close().await {
        warn!(database = %database, error = %e, "Failed to close connection cleanly");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    #[derive(Default)]
    struct ServerState {
        databases: HashSet<String>,
        reject_login: bool,
        unreachable: HashSet<String>,
        deny_create: bool,
        /// Lookup misses databases that exist, as if another client created
        /// them right after the catalog was read
        stale_lookup: bool,
        /// Another client's create commits while ours runs, so ours fails
        /// with an error the session does not recognise as a duplicate
        create_collides: bool,
        fail_version: bool,
        opened: Vec<String>,
        open_sessions: usize,
        max_open_sessions: usize,
        closed_explicitly: usize,
        create_calls: usize,
    }

    #[derive(Clone, Default)]
    struct FakeServer {
        state: Arc<Mutex<ServerState>>,
    }

    impl FakeServer {
        fn with_databases(names: &[&str]) -> Self {
            let server = Self::default();
            server
                .state()
                .databases
                .extend(names.iter().map(|n| n.to_string()));
            server
        }

        fn fresh() -> Self {
            Self::with_databases(&["postgres"])
        }

        fn state(&self) -> MutexGuard<'_, ServerState> {
            self.state.lock().unwrap()
        }
    }

    struct FakeSession {
        server: FakeServer,
        database: String,
    }

    impl Drop for FakeSession {
        fn drop(&mut self) {
            self.server.state().open_sessions -= 1;
        }
    }

    #[async_trait]
    impl Connector for FakeServer {
        type Session = FakeSession;

        async fn connect(
            &self,
            settings: &ConnectionSettings,
            database: &str,
        ) -> Result<FakeSession> {
            let mut state = self.state();
            if state.reject_login {
                bail!(
                    "password authentication failed for user \"{}\"",
                    settings.user
                );
            }
            if state.unreachable.contains(database) {
                bail!("connection refused");
            }
            if !state.databases.contains(database) {
                bail!("database \"{}\" does not exist", database);
            }

            state.opened.push(database.to_string());
            state.open_sessions += 1;
            state.max_open_sessions = state.max_open_sessions.max(state.open_sessions);

            Ok(FakeSession {
                server: self.clone(),
                database: database.to_string(),
            })
        }
    }

    #[async_trait]
    impl Session for FakeSession {
        fn database(&self) -> &str {
            &self.database
        }

        async fn database_exists(&self, name: &str) -> Result<bool> {
            let state = self.server.state();
            Ok(!state.stale_lookup && state.databases.contains(name))
        }

        async fn create_database(&self, name: &str) -> Result<CreateOutcome> {
            let mut state = self.server.state();
            state.create_calls += 1;
            if state.deny_create {
                bail!("permission denied to create database");
            }
            if state.create_collides {
                state.databases.insert(name.to_string());
                bail!("duplicate key value violates unique constraint \"pg_database_datname_index\"");
            }
            if state.databases.insert(name.to_string()) {
                Ok(CreateOutcome::Created)
            } else {
                Ok(CreateOutcome::AlreadyExisted)
            }
        }

        async fn server_version(&self) -> Result<String> {
            if self.server.state().fail_version {
                bail!("function version() does not exist");
            }
            Ok("PostgreSQL 16.2 on x86_64-pc-linux-gnu".to_string())
        }

        async fn close(self) -> Result<()> {
            self.server.state().closed_explicitly += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        events: RefCell<Vec<ProgressEvent>>,
    }

    impl RecordingReporter {
        fn kinds(&self) -> Vec<&'static str> {
            self.events.borrow().iter().map(|e| e.kind()).collect()
        }
    }

    impl Reporter for RecordingReporter {
        fn report(&self, event: &ProgressEvent) {
            self.events.borrow_mut().push(event.clone());
        }
    }

    fn settings() -> ConnectionSettings {
        ConnectionSettings::default()
    }

    #[tokio::test]
    async fn test_fresh_server_creates_database() {
        let server = FakeServer::fresh();
        let reporter = RecordingReporter::default();

        let outcome = ensure_database(&server, &settings(), &reporter)
            .await
            .unwrap();

        assert_eq!(outcome.database, "blog_platform");
        assert_eq!(outcome.provisioning, Provisioning::Created);
        assert!(outcome.server_version.starts_with("PostgreSQL"));
        assert!(server.state().databases.contains("blog_platform"));
        assert_eq!(
            reporter.kinds(),
            vec![
                "CONNECTING_ADMIN",
                "CREATING",
                "CREATED",
                "TESTING_CONNECTION",
                "CONNECTED",
                "SERVER_VERSION",
            ]
        );
    }

    #[tokio::test]
    async fn test_second_run_skips_creation() {
        let server = FakeServer::fresh();

        ensure_database(&server, &settings(), &RecordingReporter::default())
            .await
            .unwrap();

        let reporter = RecordingReporter::default();
        let outcome = ensure_database(&server, &settings(), &reporter)
            .await
            .unwrap();

        assert_eq!(outcome.provisioning, Provisioning::AlreadyExisted);
        assert_eq!(server.state().create_calls, 1);
        assert_eq!(
            reporter.kinds(),
            vec![
                "CONNECTING_ADMIN",
                "ALREADY_EXISTS",
                "TESTING_CONNECTION",
                "CONNECTED",
                "SERVER_VERSION",
            ]
        );
    }

    #[tokio::test]
    async fn test_admin_connect_failure_stops_early() {
        let server = FakeServer::fresh();
        server.state().reject_login = true;
        let reporter = RecordingReporter::default();

        let err = ensure_database(&server, &settings(), &reporter)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), FailureKind::Connect);
        assert!(err.describe().contains("password authentication failed"));
        assert_eq!(reporter.kinds(), vec!["CONNECTING_ADMIN", "FAILED"]);

        let state = server.state();
        assert_eq!(state.create_calls, 0);
        assert!(state.opened.is_empty());
    }

    #[tokio::test]
    async fn test_create_failure_skips_verification() {
        let server = FakeServer::fresh();
        server.state().deny_create = true;
        let reporter = RecordingReporter::default();

        let err = ensure_database(&server, &settings(), &reporter)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), FailureKind::Create);
        assert_eq!(reporter.kinds(), vec!["CONNECTING_ADMIN", "CREATING", "FAILED"]);

        let state = server.state();
        assert_eq!(state.opened, vec!["postgres"]);
        assert_eq!(state.open_sessions, 0);
        assert_eq!(state.closed_explicitly, 1);
    }

    #[tokio::test]
    async fn test_duplicate_on_create_counts_as_success() {
        let server = FakeServer::with_databases(&["postgres", "blog_platform"]);
        server.state().stale_lookup = true;
        let reporter = RecordingReporter::default();

        let outcome = ensure_database(&server, &settings(), &reporter)
            .await
            .unwrap();

        assert_eq!(outcome.provisioning, Provisioning::CreatedConcurrently);
        assert!(reporter.kinds().contains(&"CREATED_CONCURRENTLY"));
        assert_eq!(server.state().create_calls, 1);
    }

    #[tokio::test]
    async fn test_invalid_settings_never_connect() {
        let server = FakeServer::fresh();
        let reporter = RecordingReporter::default();
        let settings = ConnectionSettings {
            database: String::new(),
            ..settings()
        };

        let err = ensure_database(&server, &settings, &reporter)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), FailureKind::Config);
        assert_eq!(err.describe(), "invalid settings: database must not be empty");
        assert_eq!(reporter.kinds(), vec!["FAILED"]);
        assert!(server.state().opened.is_empty());
    }

    #[tokio::test]
    async fn test_version_failure_keeps_created_database() {
        let server = FakeServer::fresh();
        server.state().fail_version = true;
        let reporter = RecordingReporter::default();

        let err = ensure_database(&server, &settings(), &reporter)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), FailureKind::Verify);
        assert!(!reporter.kinds().contains(&"CONNECTED"));

        let state = server.state();
        assert!(state.databases.contains("blog_platform"));
        assert_eq!(state.open_sessions, 0);
        assert_eq!(state.closed_explicitly, 2);
    }

    #[tokio::test]
    async fn test_unreachable_target_is_verify_failure() {
        let server = FakeServer::fresh();
        server
            .state()
            .unreachable
            .insert("blog_platform".to_string());
        let reporter = RecordingReporter::default();

        let err = ensure_database(&server, &settings(), &reporter)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), FailureKind::Verify);
        assert!(err.describe().contains("connection refused"));
        assert_eq!(
            reporter.kinds(),
            vec![
                "CONNECTING_ADMIN",
                "CREATING",
                "CREATED",
                "TESTING_CONNECTION",
                "FAILED",
            ]
        );
    }

    #[tokio::test]
    async fn test_sessions_never_overlap() {
        let server = FakeServer::fresh();

        for _ in 0..2 {
            ensure_database(&server, &settings(), &RecordingReporter::default())
                .await
                .unwrap();
        }

        let state = server.state();
        assert_eq!(state.max_open_sessions, 1);
        assert_eq!(state.open_sessions, 0);
        assert_eq!(
            state.opened,
            vec!["postgres", "blog_platform", "postgres", "blog_platform"]
        );
    }

    #[tokio::test]
    async fn test_failed_event_carries_cause() {
        let server = FakeServer::fresh();
        server.state().deny_create = true;
        let reporter = RecordingReporter::default();

        ensure_database(&server, &settings(), &reporter)
            .await
            .unwrap_err();

        let events = reporter.events.borrow();
        assert_eq!(
            events.last(),
            Some(&ProgressEvent::Failed {
                error: "could not create database 'blog_platform': \
                        permission denied to create database"
                    .to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_colliding_create_counts_as_success() {
        let server = FakeServer::fresh();
        server.state().create_collides = true;
        let reporter = RecordingReporter::default();

        let outcome = ensure_database(&server, &settings(), &reporter)
            .await
            .unwrap();

        assert_eq!(outcome.provisioning, Provisioning::CreatedConcurrently);
        assert_eq!(
            reporter.kinds(),
            vec![
                "CONNECTING_ADMIN",
                "CREATING",
                "CREATED_CONCURRENTLY",
                "TESTING_CONNECTION",
                "CONNECTED",
                "SERVER_VERSION",
            ]
        );
        assert_eq!(server.state().open_sessions, 0);
    }

    /// Counts events at WARN or above
    struct WarningCounter(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for WarningCounter {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() <= Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn test_failure_is_not_logged_at_default_level() {
        let warnings = Arc::new(AtomicUsize::new(0));
        let subscriber =
            tracing_subscriber::registry().with(WarningCounter(Arc::clone(&warnings)));
        let _default = tracing::subscriber::set_default(subscriber);

        let server = FakeServer::fresh();
        server.state().deny_create = true;
        let reporter = RecordingReporter::default();

        ensure_database(&server, &settings(), &reporter)
            .await
            .unwrap_err();

        assert_eq!(reporter.kinds().last(), Some(&"FAILED"));
        assert_eq!(warnings.load(Ordering::SeqCst), 0);
    }
}
