use regex::Regex;
use sha2::{Digest, Sha256};
use sqlx::{Executor, Row, SqlitePool};
use std::collections::HashMap;

use crate::time::now_ms;
use tracing::{error, info, warn};

/// Version of the cached record layout. Bumping it wipes the mirrored stores
/// (never the pending queue) on the next open so they are re-fetched.
pub const CACHE_SCHEMA_VERSION: i64 = 1;

/// Stores cleared by a destructive cache upgrade.
const MIRRORED_STORES: &[&str] = &["tasks", "areas", "users", "meta"];

fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    if trimmed.len() > 160 {
        format!("{}…", &trimmed[..160])
    } else {
        trimmed.to_string()
    }
}

static MIGRATIONS: &[(&str, &str)] = &[
    (
        "202610190900_offline_store.sql",
        include_str!("../migrations/202610190900_offline_store.sql"),
    ),
    (
        "202610190930_pending_completions.sql",
        include_str!("../migrations/202610190930_pending_completions.sql"),
    ),
    (
        "202610200900_task_authoritative_version.sql",
        include_str!("../migrations/202610200900_task_authoritative_version.sql"),
    ),
];

fn strip_comments(raw_sql: &str) -> String {
    raw_sql
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            !(t.is_empty() || t.starts_with("--"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn checksum(cleaned: &str) -> String {
    format!("{:x}", Sha256::digest(cleaned.as_bytes()))
}

pub async fn apply_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
           version   TEXT PRIMARY KEY,\
           applied_at INTEGER NOT NULL,\
           checksum TEXT NOT NULL\
         )",
    )
    .await?;

    let rows = sqlx::query("SELECT version, checksum FROM schema_migrations")
        .fetch_all(pool)
        .await?;
    let mut applied: HashMap<String, String> = HashMap::new();
    for r in rows {
        if let (Ok(v), Ok(c)) = (
            r.try_get::<String, _>("version"),
            r.try_get::<String, _>("checksum"),
        ) {
            applied.insert(v, c);
        }
    }
    let add_col_re = Regex::new(r"(?i)^ALTER\s+TABLE\s+(\w+)\s+ADD\s+COLUMN\s+(\w+)")?;

    for (filename, raw_sql) in MIGRATIONS {
        let cleaned = strip_comments(raw_sql);
        let checksum = checksum(&cleaned);

        if let Some(stored) = applied.get(*filename) {
            if stored != &checksum {
                anyhow::bail!("migration {} edited after application", filename);
            }
            info!(target: "shiftcheck", event = "migration_skip_file", file = %filename);
            continue;
        }

        let mut tx = pool.begin().await?;
        for stmt in cleaned.split(';') {
            let s = stmt.trim();
            if s.is_empty() {
                continue;
            }
            let upper = s.to_ascii_uppercase();
            if upper == "BEGIN" || upper == "COMMIT" {
                continue;
            }
            if let Some(caps) = add_col_re.captures(s) {
                let (table, col) = (&caps[1], &caps[2]);
                let exists: Option<i64> = sqlx::query_scalar(
                    "SELECT 1 FROM pragma_table_info(?) WHERE name = ?",
                )
                .bind(table)
                .bind(col)
                .fetch_optional(&mut *tx)
                .await?;
                if exists.is_some() {
                    info!(target: "shiftcheck", event = "migration_stmt_skip", file = %filename, sql = %preview(s));
                    continue;
                }
            }
            info!(target: "shiftcheck", event = "migration_stmt", file = %filename, sql = %preview(s));
            if let Err(e) = sqlx::query(s).execute(&mut *tx).await {
                error!(target: "shiftcheck", event = "migration_stmt_error", file = %filename, sql = %preview(s), error = %e);
                return Err(e.into());
            }
        }

        sqlx::query(
            "INSERT INTO schema_migrations (version, applied_at, checksum) VALUES (?, ?, ?)",
        )
        .bind(*filename)
        .bind(now_ms())
        .bind(&checksum)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(target: "shiftcheck", event = "migration_file_applied", file = %filename);
    }

    gate_cache_schema(pool, CACHE_SCHEMA_VERSION).await?;

    Ok(())
}

/// Compare the stored cache layout version with `expected` and clear the
/// mirrored stores when the on-disk layout is older.
pub async fn gate_cache_schema(pool: &SqlitePool, expected: i64) -> anyhow::Result<()> {
    let stored: i64 = sqlx::query_scalar("PRAGMA user_version;")
        .fetch_one(pool)
        .await?;

    if stored == expected {
        return Ok(());
    }
    if stored > expected {
        warn!(
            target: "shiftcheck",
            event = "cache_schema_newer",
            stored,
            expected
        );
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    if stored > 0 {
        for store in MIRRORED_STORES {
            sqlx::query(&format!("DELETE FROM {store}"))
                .execute(&mut *tx)
                .await?;
        }
        warn!(
            target: "shiftcheck",
            event = "cache_schema_reset",
            from = stored,
            to = expected
        );
    }
    // PRAGMA does not accept bound parameters.
    sqlx::query(&format!("PRAGMA user_version = {expected};"))
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    info!(
        target: "shiftcheck",
        event = "cache_schema_set",
        version = expected
    );
    Ok(())
}
