//! Progress reporting
//!
//! Every status line the routine produces is a [`ProgressEvent`]. Reporters
//! decide where the rendered lines go; the binary prints them to stdout.

use tracing::info;

/// All progress events emitted while ensuring a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Opening the administrative connection
    ConnectingAdmin { admin_database: String },

    /// Target database is absent, about to create it
    Creating { database: String },

    /// `CREATE DATABASE` succeeded
    Created { database: String },

    /// Catalog lookup found the target database
    AlreadyExists { database: String },

    /// Another client created the database between lookup and create
    CreatedConcurrently { database: String },

    /// Opening the target connection
    TestingConnection { database: String },

    /// Target connection is up
    Connected { database: String },

    /// Result of the version query
    ServerVersion { version: String },

    /// The routine stopped at an error
    Failed { error: String },
}

impl ProgressEvent {
    /// Stable identifier, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectingAdmin { .. } => "CONNECTING_ADMIN",
            Self::Creating { .. } => "CREATING",
            Self::Created { .. } => "CREATED",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::CreatedConcurrently { .. } => "CREATED_CONCURRENTLY",
            Self::TestingConnection { .. } => "TESTING_CONNECTION",
            Self::Connected { .. } => "CONNECTED",
            Self::ServerVersion { .. } => "SERVER_VERSION",
            Self::Failed { .. } => "FAILED",
        }
    }

    /// Convert event to a human-readable message.
    pub fn message(&self) -> String {
        match self {
            Self::ConnectingAdmin { admin_database } => {
                format!("Connecting to PostgreSQL ({} db)...", admin_database)
            }
            Self::Creating { database } => format!("Creating database '{}'...", database),
            Self::Created { database } => {
                format!("✅ Database '{}' created successfully!", database)
            }
            Self::AlreadyExists { database } => {
                format!("✅ Database '{}' already exists!", database)
            }
            Self::CreatedConcurrently { database } => {
                format!(
                    "✅ Database '{}' was created concurrently by another client!",
                    database
                )
            }
            Self::TestingConnection { database } => {
                format!("\nTesting connection to {}...", database)
            }
            Self::Connected { database } => format!("✅ Connected to {}!", database),
            Self::ServerVersion { version } => format!("PostgreSQL version: {}", version),
            Self::Failed { error } => format!("❌ Error: {}", error),
        }
    }
}

/// Sink for progress events.
pub trait Reporter {
    fn report(&self, event: &ProgressEvent);
}

/// Prints every event to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn report(&self, event: &ProgressEvent) {
        info!(event = %event.kind(), "Progress");
        println!("{}", event.message());
    }
}
