use anyhow::{Context, Result as AnyResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::path::Path;

pub const DB_FILE_NAME: &str = "shiftcheck.sqlite3";

/// Open (creating if needed) the on-device store and apply the connection pragmas.
pub async fn open_sqlite_pool(db_path: &Path) -> AnyResult<Pool<Sqlite>> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            tracing::error!(
                target: "shiftcheck",
                error = %e,
                event = "data_dir_create_failed",
                path = %parent.display()
            );
            e
        })?;
    }
    tracing::info!(target: "shiftcheck", event = "db_path", path = %db_path.display());

    let opts = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .after_connect(|conn, _| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys=ON;")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("PRAGMA busy_timeout = 5000;")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .connect_with(opts)
        .await
        .with_context(|| format!("open sqlite store at {}", db_path.display()))?;

    log_effective_pragmas(&pool).await;

    Ok(pool)
}

/// Open the store and bring its schema up to date.
pub async fn open_and_migrate(db_path: &Path) -> AnyResult<Pool<Sqlite>> {
    let pool = open_sqlite_pool(db_path).await?;
    crate::migrate::apply_migrations(&pool)
        .await
        .context("apply local store migrations")?;
    Ok(pool)
}

#[derive(Debug)]
struct StorePragmas {
    sqlite_version: String,
    journal_mode: String,
    synchronous: i64,
    busy_timeout_ms: i64,
}

async fn read_pragmas(pool: &Pool<Sqlite>) -> sqlx::Result<StorePragmas> {
    let sqlite_version: String = sqlx::query_scalar("SELECT sqlite_version()").fetch_one(pool).await?;
    let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode;").fetch_one(pool).await?;
    let synchronous: i64 = sqlx::query_scalar("PRAGMA synchronous;").fetch_one(pool).await?;
    let busy_timeout_ms: i64 = sqlx::query_scalar("PRAGMA busy_timeout;").fetch_one(pool).await?;
    Ok(StorePragmas {
        sqlite_version,
        journal_mode,
        synchronous,
        busy_timeout_ms,
    })
}

async fn log_effective_pragmas(pool: &Pool<Sqlite>) {
    let pragmas = match read_pragmas(pool).await {
        Ok(pragmas) => pragmas,
        Err(e) => {
            tracing::warn!(target: "shiftcheck", event = "db_pragmas_unreadable", error = %e);
            return;
        }
    };
    tracing::info!(
        target: "shiftcheck",
        event = "db_open",
        sqlite_version = %pragmas.sqlite_version,
        journal_mode = %pragmas.journal_mode,
        synchronous = pragmas.synchronous,
        busy_timeout_ms = pragmas.busy_timeout_ms
    );
    // A lost WAL means queued completions can vanish on a crash.
    if !pragmas.journal_mode.eq_ignore_ascii_case("wal") {
        tracing::warn!(
            target: "shiftcheck",
            event = "db_open_warning",
            journal_mode = %pragmas.journal_mode,
            "store is not in WAL mode"
        );
    }
}
