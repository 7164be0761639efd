//! Helpers for provisioning disposable Postgres databases for integration tests.

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow, bail};
use postgres::NoTls;
use url::Url;

/// Environment variable naming the server used by database-backed tests.
pub const TEST_DATABASE_ENV: &str = "WAFFLE_TEST_DATABASE_URL";

/// Handle to a disposable database; dropped databases are removed from the server.
pub struct TestDatabase {
    connection_string: String,
    admin_url: String,
    database: String,
}

impl TestDatabase {
    /// Connection string that can be passed to `sqlx` or other Postgres clients.
    #[must_use]
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        let _ = run_admin_statement(
            &self.admin_url,
            format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", self.database),
        );
    }
}

/// Create a fresh database on the server named by `WAFFLE_TEST_DATABASE_URL`.
///
/// Tests decide whether to skip when this helper returns an error.
///
/// # Errors
///
/// Returns an error if the variable is unset or the database cannot be created.
pub fn start_postgres() -> Result<TestDatabase> {
    let url = std::env::var(TEST_DATABASE_ENV)
        .with_context(|| format!("{TEST_DATABASE_ENV} is not set"))?;
    if url.trim().is_empty() {
        bail!("{TEST_DATABASE_ENV} is empty");
    }
    create_unique_database(&url)
}

fn create_unique_database(base_url: &str) -> Result<TestDatabase> {
    let parsed = Url::parse(base_url).context("invalid postgres connection url")?;
    let database = unique_database_name();

    let mut database_url = parsed.clone();
    database_url.set_path(&format!("/{database}"));

    let mut admin = parsed;
    admin.set_path("/postgres");
    let admin_url = admin.to_string();

    run_admin_statement(&admin_url, format!("CREATE DATABASE \"{database}\""))?;

    Ok(TestDatabase {
        connection_string: database_url.to_string(),
        admin_url,
        database,
    })
}

// The blocking client must not run on a tokio worker thread.
fn run_admin_statement(admin_url: &str, statement: String) -> Result<()> {
    let admin = admin_url.to_string();
    std::thread::spawn(move || -> Result<()> {
        let config = postgres::Config::from_str(&admin)?;
        let mut client = config.connect(NoTls)?;
        client
            .simple_query(&statement)
            .map(|_| ())
            .with_context(|| format!("failed to execute `{statement}`"))
    })
    .join()
    .unwrap_or_else(|_| Err(anyhow!("admin statement thread panicked")))
}

fn unique_database_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let pid = std::process::id();
    format!("waffle_test_{pid}_{nanos}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_database_names_are_prefixed() {
        let name = unique_database_name();
        assert!(name.starts_with("waffle_test_"));
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }
}
