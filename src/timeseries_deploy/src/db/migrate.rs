//! Embedded schema migrations.

use anyhow::anyhow;
use diesel::{Connection, SqliteConnection, connection::SimpleConnection};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};

use super::sqlite_path;

/// Embedded Diesel migrations bundled with this crate.
///
/// These are applied by [`run_sqlite`] to bring the time-series schema up to date.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Runs pending Diesel migrations on a SQLite database at the given URL or path.
pub fn run_sqlite(url: &str) -> anyhow::Result<()> {
    let mut conn = SqliteConnection::establish(sqlite_path(url))?;
    conn.batch_execute("PRAGMA journal_mode=WAL;")?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow!(e))?;
    tracing::info!(applied = applied.len(), "migrations applied");
    Ok(())
}

/// Runs pending migrations for `database_url`.
///
/// Accepts `sqlite:` URLs and bare file paths; other schemes are rejected.
pub fn run_all(database_url: &str) -> anyhow::Result<()> {
    if database_url.contains("://") && !database_url.starts_with("sqlite://") {
        anyhow::bail!("Unsupported DATABASE_URL: {database_url}");
    }
    run_sqlite(database_url)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn migrations_apply_on_temp_file() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let path = temp.path().to_string_lossy().to_string();

        run_sqlite(&path).expect("migration run");
        // re-running is a no-op
        run_all(&format!("sqlite:{path}")).expect("second run");

        let mut conn = SqliteConnection::establish(&path).unwrap();
        conn.batch_execute("INSERT INTO metric_reference (metric) VALUES ('newCasesByPublishDate')")
            .unwrap();
    }

    #[test]
    fn postgres_urls_are_rejected() {
        assert!(run_all("postgres://localhost/db").is_err());
    }
}
