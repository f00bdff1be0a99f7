use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use sqlx::SqlitePool;

use shiftcheck_lib::cache::{LocalCache, Store, META_AREAS, META_TASKS, META_USERS};
use shiftcheck_lib::client::resolve_db_path;
use shiftcheck_lib::db::open_and_migrate;
use shiftcheck_lib::time::to_wire;
use shiftcheck_lib::{
    AppError, HttpTaskService, NewCompletion, OfflineSync, PassOutcome, PendingCompletion,
    PendingQueue, SyncConfig, TargetStatus,
};

#[derive(Debug, Parser)]
#[command(name = "shiftcheck", about = "Offline checklist cache and sync queue", version)]
struct Cli {
    /// Path to the local store. Overrides the configured location.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show queue counts and the last refresh of each store.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Inspect or edit the pending-mutation queue.
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Record a completion offline. It is sent on the next sync.
    Complete {
        #[arg(long)]
        task: String,
        /// Checklist item to complete. Omit to complete the whole task.
        #[arg(long)]
        item: Option<String>,
        #[arg(long)]
        status: TargetStatus,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Run one synchronization pass against the configured server.
    Sync {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Subcommand)]
enum QueueCommand {
    /// List entries not yet confirmed by the server, oldest first.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Drop an entry by its local id.
    Discard { local_id: String },
}

#[tokio::main]
async fn main() {
    shiftcheck_lib::init_logging();

    let cli = Cli::parse();
    let code = match handle_cli(cli).await {
        Ok(code) => code,
        Err(err) => {
            let app: AppError = err.into();
            eprintln!("Error: {} ({})", app.message(), app.root_code());
            1
        }
    };
    shiftcheck_lib::flush_file_logs();
    process::exit(code);
}

async fn handle_cli(cli: Cli) -> Result<i32> {
    let mut config = SyncConfig::load().context("load configuration")?;
    if let Some(db) = cli.db {
        config.db_path = Some(db);
    }
    let db_path = resolve_db_path(&config);

    match cli.command {
        Commands::Status { json } => status(&db_path, json).await,
        Commands::Queue(QueueCommand::List { json }) => queue_list(&db_path, json).await,
        Commands::Queue(QueueCommand::Discard { local_id }) => queue_discard(&db_path, &local_id).await,
        Commands::Complete {
            task,
            item,
            status,
            reason,
            notes,
        } => {
            let completion = NewCompletion {
                task_id: task,
                checklist_item_id: item,
                target_status: status,
                reason,
                notes,
            };
            complete(&db_path, completion).await
        }
        Commands::Sync { json } => sync(config, json).await,
    }
}

async fn open(db_path: &Path) -> Result<SqlitePool> {
    open_and_migrate(db_path).await
}

async fn status(db_path: &Path, json: bool) -> Result<i32> {
    let pool = open(db_path).await?;
    let queue = PendingQueue::new(pool.clone());
    let cache = LocalCache::new(pool.clone());

    let pending = queue.pending_count().await?;
    let failed = queue.failed_count().await?;
    let meta = cache.all_meta().await?;
    let mut stores = Vec::new();
    for (store, key) in [
        (Store::Tasks, META_TASKS),
        (Store::Areas, META_AREAS),
        (Store::Users, META_USERS),
    ] {
        let count = cache.count(store).await?;
        let last = meta.iter().find(|m| m.key == key).map(|m| m.last_synced_at);
        stores.push((key, count, last));
    }
    pool.close().await;

    if json {
        let stores: serde_json::Map<String, serde_json::Value> = stores
            .iter()
            .map(|(key, count, last)| {
                (
                    key.to_string(),
                    json!({ "cached": count, "lastSyncedAt": last.as_ref().map(to_wire) }),
                )
            })
            .collect();
        let payload = json!({
            "db": db_path.display().to_string(),
            "pendingCount": pending,
            "failedCount": failed,
            "stores": stores,
        });
        println!("{}", serde_json::to_string_pretty(&payload).context("serialize status")?);
    } else {
        println!("Store:    {}", db_path.display());
        println!("Pending:  {pending}");
        println!("Failed:   {failed}");
        for (key, count, last) in &stores {
            let last = last.as_ref().map(to_wire).unwrap_or_else(|| "never".into());
            println!("{key:<8}  {count:>6} cached, last synced {last}");
        }
    }
    Ok(0)
}

fn entry_state(entry: &PendingCompletion) -> &'static str {
    if entry.failed {
        "failed"
    } else if entry.attempts > 0 {
        "retrying"
    } else {
        "pending"
    }
}

async fn queue_list(db_path: &Path, json: bool) -> Result<i32> {
    let pool = open(db_path).await?;
    let batch = PendingQueue::new(pool.clone()).all_entries().await?;
    pool.close().await;

    if json {
        let corrupt: Vec<_> = batch
            .corrupt
            .iter()
            .map(|c| json!({ "seq": c.seq, "localId": c.local_id, "reason": c.reason }))
            .collect();
        let payload = json!({ "entries": batch.entries, "corrupt": corrupt });
        println!("{}", serde_json::to_string_pretty(&payload).context("serialize queue")?);
        return Ok(0);
    }

    if batch.is_empty() {
        println!("Queue is empty.");
        return Ok(0);
    }
    for entry in &batch.entries {
        let target = entry.checklist_item_id.as_deref().unwrap_or("<task>");
        print!(
            "{}  {:<8}  {} / {}  -> {}",
            entry.local_id,
            entry_state(entry),
            entry.task_id,
            target,
            entry.target_status
        );
        match &entry.last_error {
            Some(err) => println!("  ({err})"),
            None => println!(),
        }
    }
    for corrupt in &batch.corrupt {
        println!("{}  corrupt   {}", corrupt.local_id, corrupt.reason);
    }
    Ok(0)
}

async fn queue_discard(db_path: &Path, local_id: &str) -> Result<i32> {
    let pool = open(db_path).await?;
    let removed = PendingQueue::new(pool.clone()).discard(local_id).await?;
    pool.close().await;
    if removed {
        println!("Discarded {local_id}.");
        Ok(0)
    } else {
        eprintln!("No queue entry {local_id}.");
        Ok(1)
    }
}

async fn complete(db_path: &Path, completion: NewCompletion) -> Result<i32> {
    let pool = open(db_path).await?;
    let local_id = PendingQueue::new(pool.clone()).enqueue(completion).await?;
    pool.close().await;
    println!("{local_id}");
    Ok(0)
}

async fn sync(config: SyncConfig, json: bool) -> Result<i32> {
    let remote = HttpTaskService::from_config(&config).context("configure remote service")?;
    let client = OfflineSync::open(config, Arc::new(remote), true).await?;
    let outcome = client.force_sync_now().await;
    let status = client.status();
    client.shutdown().await;

    let report = match outcome? {
        PassOutcome::Completed(report) => report,
        PassOutcome::Coalesced | PassOutcome::Offline => {
            println!("No pass was run.");
            return Ok(0);
        }
    };

    if json {
        let payload = json!({ "report": report, "status": status });
        println!("{}", serde_json::to_string_pretty(&payload).context("serialize report")?);
    } else {
        println!(
            "Synced {} ({} merged), {} already handled, {} rejected, {} corrupt.",
            report.synced.len(),
            report.merged,
            report.already_handled,
            report.rejected,
            report.corrupt
        );
        println!("Pending: {}  Failed: {}", status.pending_count, status.failed_count);
        if let Some(reason) = &report.halted {
            println!("Stopped early: {reason}");
        }
    }
    Ok(if report.is_halted() { 2 } else { 0 })
}
