//! SQL statements issued against the server

/// Catalog lookup for a database by name. Takes the name as `$1`.
pub const DATABASE_EXISTS: &str = "SELECT 1 FROM pg_database WHERE datname = $1";

/// Informational query run on the target connection.
pub const SERVER_VERSION: &str = "SELECT version()";

/// Quote an identifier, doubling any embedded double quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Build the `CREATE DATABASE` statement for `name`.
///
/// Identifiers cannot be bound as parameters, so the name is quoted instead.
/// Must run outside a transaction block.
pub fn create_database_statement(name: &str) -> String {
    format!("CREATE DATABASE {}", quote_ident(name))
}
