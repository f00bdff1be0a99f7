//! Local Persistent Cache: key-indexed record stores for tasks, areas and
//! users plus the `meta` store of refresh timestamps.
//!
//! Records are stored as their JSON wire form next to the columns the
//! secondary lookups filter on, so an equality scan is answered by an index
//! instead of loading the store at the call site.

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::model::{CachedArea, CachedTask, CachedUser, SyncMeta, TaskStatus};
use crate::time::{from_wire, now_ms, to_wire};

pub const META_TASKS: &str = "tasks";
pub const META_AREAS: &str = "areas";
pub const META_USERS: &str = "users";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Store {
    Tasks,
    Areas,
    Users,
}

impl Store {
    pub fn table(&self) -> &'static str {
        match self {
            Store::Tasks => "tasks",
            Store::Areas => "areas",
            Store::Users => "users",
        }
    }
}

/// Value bound to a secondary index column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexValue {
    Text(Option<String>),
    Int(i64),
}

/// A record type held by one of the cache stores.
pub trait CacheRecord: Serialize + DeserializeOwned + Send + Sync + Unpin {
    const STORE: Store;

    fn id(&self) -> &str;

    /// Columns stored beside the body, in a fixed order.
    fn index_columns(&self) -> Vec<(&'static str, IndexValue)>;

    /// `(sync_version, optimistic)` for versioned records.
    fn version(&self) -> Option<(i64, bool)> {
        None
    }
}

impl CacheRecord for CachedTask {
    const STORE: Store = Store::Tasks;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_columns(&self) -> Vec<(&'static str, IndexValue)> {
        vec![
            ("area_id", IndexValue::Text(Some(self.area_id.clone()))),
            ("status", IndexValue::Text(Some(self.status.as_str().to_string()))),
            (
                "due_date",
                IndexValue::Text(self.due_date.map(|d| d.to_string())),
            ),
            ("sync_version", IndexValue::Int(self.sync_version)),
            ("optimistic", IndexValue::Int(i64::from(self.optimistic))),
        ]
    }

    fn version(&self) -> Option<(i64, bool)> {
        Some((self.sync_version, self.optimistic))
    }
}

impl CacheRecord for CachedArea {
    const STORE: Store = Store::Areas;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_columns(&self) -> Vec<(&'static str, IndexValue)> {
        vec![("parent_id", IndexValue::Text(self.parent_id.clone()))]
    }
}

impl CacheRecord for CachedUser {
    const STORE: Store = Store::Users;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_columns(&self) -> Vec<(&'static str, IndexValue)> {
        Vec::new()
    }
}

/// Equality filters backed by secondary indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexFilter {
    TaskArea(String),
    TaskStatus(TaskStatus),
    TaskDueDate(NaiveDate),
    AreaParent(String),
}

impl IndexFilter {
    pub fn store(&self) -> Store {
        match self {
            IndexFilter::TaskArea(_) | IndexFilter::TaskStatus(_) | IndexFilter::TaskDueDate(_) => {
                Store::Tasks
            }
            IndexFilter::AreaParent(_) => Store::Areas,
        }
    }

    fn column(&self) -> &'static str {
        match self {
            IndexFilter::TaskArea(_) => "area_id",
            IndexFilter::TaskStatus(_) => "status",
            IndexFilter::TaskDueDate(_) => "due_date",
            IndexFilter::AreaParent(_) => "parent_id",
        }
    }

    /// In-memory form of the filter, for records that did not come from the store.
    pub fn matches_task(&self, task: &CachedTask) -> bool {
        match self {
            IndexFilter::TaskArea(id) => task.area_id == *id,
            IndexFilter::TaskStatus(status) => task.status == *status,
            IndexFilter::TaskDueDate(date) => task.due_date == Some(*date),
            IndexFilter::AreaParent(_) => false,
        }
    }

    pub fn matches_area(&self, area: &CachedArea) -> bool {
        match self {
            IndexFilter::AreaParent(id) => area.parent_id.as_deref() == Some(id.as_str()),
            _ => false,
        }
    }

    fn value(&self) -> String {
        match self {
            IndexFilter::TaskArea(id) | IndexFilter::AreaParent(id) => id.clone(),
            IndexFilter::TaskStatus(status) => status.as_str().to_string(),
            IndexFilter::TaskDueDate(date) => date.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    /// An authoritative record older than the cached one was ignored.
    SkippedStale,
}

pub(crate) async fn read_body(
    conn: &mut SqliteConnection,
    store: Store,
    id: &str,
) -> SyncResult<Option<String>> {
    let sql = format!("SELECT body FROM {} WHERE id = ?", store.table());
    Ok(sqlx::query_scalar(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?)
}

pub(crate) async fn read_record<R: CacheRecord>(
    conn: &mut SqliteConnection,
    id: &str,
) -> SyncResult<Option<R>> {
    match read_body(conn, R::STORE, id).await? {
        Some(body) => Ok(Some(serde_json::from_str(&body)?)),
        None => Ok(None),
    }
}

/// Start a transaction that takes the write lock up front, so a read followed
/// by a write cannot fail with SQLITE_BUSY when another writer commits first.
pub(crate) async fn begin_write(pool: &SqlitePool) -> SyncResult<Transaction<'static, Sqlite>> {
    Ok(pool.begin_with("BEGIN IMMEDIATE").await?)
}

/// Upsert a record as-is. A non-optimistic versioned record is server truth
/// and moves the authoritative version; an optimistic one leaves it alone.
pub(crate) async fn write_record<R: CacheRecord>(
    conn: &mut SqliteConnection,
    record: &R,
) -> SyncResult<PutOutcome> {
    let authoritative = match record.version() {
        Some((version, false)) => Some(version),
        _ => None,
    };
    write_record_with(conn, record, authoritative).await
}

/// Upsert `record`, refusing it when `authoritative` is older than the
/// cached authoritative version.
///
/// `authoritative` is the server version the record is derived from; `None`
/// marks a purely local write.
pub(crate) async fn write_record_with<R: CacheRecord>(
    conn: &mut SqliteConnection,
    record: &R,
    authoritative: Option<i64>,
) -> SyncResult<PutOutcome> {
    let table = R::STORE.table();
    let versioned = record.version().is_some();

    if let (true, Some(incoming)) = (versioned, authoritative) {
        let sql = format!("SELECT authoritative_version FROM {table} WHERE id = ?");
        let cached: Option<i64> = sqlx::query_scalar(&sql)
            .bind(record.id())
            .fetch_optional(&mut *conn)
            .await?;
        if let Some(cached) = cached {
            if incoming < cached {
                warn!(
                    target: "shiftcheck",
                    event = "cache_put_stale",
                    store = table,
                    id = record.id(),
                    incoming,
                    cached
                );
                return Ok(PutOutcome::SkippedStale);
            }
        }
    }

    let body = serde_json::to_string(record)?;
    let mut columns = record.index_columns();
    if versioned {
        columns.push(("authoritative_version", IndexValue::Int(authoritative.unwrap_or(0))));
    }

    let mut names = vec!["id"];
    names.extend(columns.iter().map(|(name, _)| *name));
    names.extend(["body", "cached_at"]);
    let placeholders = vec!["?"; names.len()].join(", ");
    let updates = names[1..]
        .iter()
        // A local write keeps the confirmed version of an existing row.
        .filter(|name| authoritative.is_some() || **name != "authoritative_version")
        .map(|name| format!("{name} = excluded.{name}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders}) ON CONFLICT(id) DO UPDATE SET {updates}",
        names.join(", ")
    );

    let mut query = sqlx::query(&sql).bind(record.id());
    for (_, value) in columns {
        query = match value {
            IndexValue::Text(text) => query.bind(text),
            IndexValue::Int(int) => query.bind(int),
        };
    }
    query
        .bind(body)
        .bind(now_ms())
        .execute(&mut *conn)
        .await?;
    Ok(PutOutcome::Written)
}

pub(crate) async fn remove_record(
    conn: &mut SqliteConnection,
    store: Store,
    id: &str,
) -> SyncResult<bool> {
    let sql = format!("DELETE FROM {} WHERE id = ?", store.table());
    let res = sqlx::query(&sql).bind(id).execute(&mut *conn).await?;
    Ok(res.rows_affected() > 0)
}

#[derive(Clone)]
pub struct LocalCache {
    pool: SqlitePool,
}

impl LocalCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn get<R: CacheRecord>(&self, id: &str) -> SyncResult<Option<R>> {
        let mut conn = self.pool.acquire().await?;
        read_record(&mut conn, id).await
    }

    /// All records of a store, optionally narrowed by an indexed equality filter.
    pub async fn get_all<R: CacheRecord>(&self, filter: Option<&IndexFilter>) -> SyncResult<Vec<R>> {
        let table = R::STORE.table();
        let rows = match filter {
            Some(filter) => {
                if filter.store() != R::STORE {
                    return Err(SyncError::validation(format!(
                        "filter {filter:?} does not apply to the {table} store"
                    )));
                }
                let sql = format!(
                    "SELECT id, body FROM {table} WHERE {} = ? ORDER BY id",
                    filter.column()
                );
                sqlx::query(&sql)
                    .bind(filter.value())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("SELECT id, body FROM {table} ORDER BY id");
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.try_get("body")?;
            records.push(serde_json::from_str(&body)?);
        }
        debug!(target: "shiftcheck", event = "cache_get_all", store = table, count = records.len());
        Ok(records)
    }

    /// Upsert, replacing any record with the same id unless it is an
    /// authoritative task older than the one already confirmed.
    pub async fn put<R: CacheRecord>(&self, record: &R) -> SyncResult<PutOutcome> {
        let mut tx = begin_write(&self.pool).await?;
        let outcome = write_record(&mut tx, record).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn delete<R: CacheRecord>(&self, id: &str) -> SyncResult<()> {
        let mut conn = self.pool.acquire().await?;
        remove_record(&mut conn, R::STORE, id).await?;
        Ok(())
    }

    pub async fn ids(&self, store: Store) -> SyncResult<Vec<String>> {
        let sql = format!("SELECT id FROM {} ORDER BY id", store.table());
        Ok(sqlx::query_scalar(&sql).fetch_all(&self.pool).await?)
    }

    pub async fn count(&self, store: Store) -> SyncResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", store.table());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    /// Tasks that still carry unconfirmed local effects.
    pub async fn optimistic_task_ids(&self) -> SyncResult<Vec<String>> {
        Ok(
            sqlx::query_scalar("SELECT id FROM tasks WHERE optimistic = 1 ORDER BY id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn get_meta(&self, key: &str) -> SyncResult<Option<DateTime<Utc>>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT last_synced_at FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match raw {
            Some(raw) => from_wire(&raw)
                .map(Some)
                .ok_or_else(|| SyncError::CacheUnavailable(format!("corrupted meta row `{key}`"))),
            None => Ok(None),
        }
    }

    /// Every recorded refresh, ordered by key.
    pub async fn all_meta(&self) -> SyncResult<Vec<SyncMeta>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, last_synced_at FROM meta ORDER BY key")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(key, raw)| match from_wire(&raw) {
                Some(last_synced_at) => Ok(SyncMeta { key, last_synced_at }),
                None => Err(SyncError::CacheUnavailable(format!("corrupted meta row `{key}`"))),
            })
            .collect()
    }

    pub async fn set_meta(&self, key: &str, at: DateTime<Utc>) -> SyncResult<()> {
        sqlx::query(
            "INSERT INTO meta (key, last_synced_at) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET last_synced_at = excluded.last_synced_at",
        )
        .bind(key)
        .bind(to_wire(&at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
