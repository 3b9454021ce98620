//! Database sessions
//!
//! The ensure routine only talks to the server through [`Connector`] and
//! [`Session`]. [`PgConnector`] is the real implementation over the
//! PostgreSQL wire protocol.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, instrument, warn};

use crate::settings::ConnectionSettings;
use crate::sql;

/// Result of a `CREATE DATABASE` that did not fail outright
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// The server reported the database as a duplicate
    AlreadyExisted,
}

/// Opens sessions to a server.
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: Session;

    /// Connect to `database` using the credentials in `settings`.
    async fn connect(&self, settings: &ConnectionSettings, database: &str)
        -> Result<Self::Session>;
}

/// An open, auto-commit session.
///
/// Dropping a session releases it. `close` does the same but waits for the
/// connection to shut down.
#[async_trait]
pub trait Session: Send + Sync {
    /// Database this session is connected to
    fn database(&self) -> &str;

    async fn database_exists(&self, name: &str) -> Result<bool>;

    async fn create_database(&self, name: &str) -> Result<CreateOutcome>;

    async fn server_version(&self) -> Result<String>;

    async fn close(self) -> Result<()>;
}

/// Whether a failed `CREATE DATABASE` lost a race with another client.
///
/// A create that starts after the other one committed gets `42P04`. Two
/// creates running at the same time collide on `pg_database_datname_index`
/// and the loser gets `23505` instead.
pub fn is_duplicate_database(code: Option<&SqlState>) -> bool {
    matches!(
        code,
        Some(c) if *c == SqlState::DUPLICATE_DATABASE || *c == SqlState::UNIQUE_VIOLATION
    )
}

/// Connects over TCP without TLS.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgConnector;

#[async_trait]
impl Connector for PgConnector {
    type Session = PgSession;

    #[instrument(skip_all, fields(host = %settings.host, port = settings.port, database = %database))]
    async fn connect(&self, settings: &ConnectionSettings, database: &str) -> Result<PgSession> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&settings.host)
            .port(settings.port)
            .user(&settings.user)
            .dbname(database)
            .application_name(&settings.application_name);
        if let Some(password) = &settings.password {
            config.password(password);
        }
        if let Some(timeout) = settings.connect_timeout {
            config.connect_timeout(timeout);
        }

        let (client, connection) = config.connect(NoTls).await.with_context(|| {
            format!(
                "Failed to connect to {}:{}/{}",
                settings.host, settings.port, database
            )
        })?;

        let target = database.to_string();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(database = %target, error = %e, "Connection closed with error");
            }
        });

        debug!("Connected");

        Ok(PgSession {
            client,
            driver,
            database: database.to_string(),
        })
    }
}

/// A live `tokio-postgres` client plus the task driving its connection.
///
/// tokio-postgres never opens a transaction on its own, so every statement
/// runs in auto-commit mode. Dropping the client ends the driver task.
pub struct PgSession {
    client: Client,
    driver: JoinHandle<()>,
    database: String,
}

#[async_trait]
impl Session for PgSession {
    fn database(&self) -> &str {
        &self.database
    }

    async fn database_exists(&self, name: &str) -> Result<bool> {
        let row = self
            .client
            .query_opt(sql::DATABASE_EXISTS, &[&name])
            .await
            .context("Catalog lookup failed")?;
        Ok(row.is_some())
    }

    async fn create_database(&self, name: &str) -> Result<CreateOutcome> {
        // Simple query protocol, outside any transaction block
        match self
            .client
            .batch_execute(&sql::create_database_statement(name))
            .await
        {
            Ok(()) => Ok(CreateOutcome::Created),
            Err(e) if is_duplicate_database(e.code()) => {
                debug!(database = %name, "Database created by another client");
                Ok(CreateOutcome::AlreadyExisted)
            }
            Err(e) => Err(e).context("CREATE DATABASE failed"),
        }
    }

    async fn server_version(&self) -> Result<String> {
        let row = self
            .client
            .query_one(sql::SERVER_VERSION, &[])
            .await
            .context("Version query failed")?;
        row.try_get::<_, String>(0)
            .context("Version query returned an unexpected value")
    }

    async fn close(self) -> Result<()> {
        let Self {
            client,
            driver,
            database,
        } = self;

        drop(client);
        driver
            .await
            .with_context(|| format!("Connection task for {} did not shut down", database))?;

        debug!(database = %database, "Connection closed");
        Ok(())
    }
}
