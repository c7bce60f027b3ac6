use anyhow::Context;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use uuid::Uuid;

use leaseflow::config::PoolSettings;
use leaseflow::db;
use leaseflow::jobs::{store_for, ContextsRepo, HomogeneityKey, NewJob, QueueKindName, Watchdog};
use leaseflow::telemetry;

/// Operator tool for leaseflow queues.
#[derive(Parser, Debug)]
#[command(name = "leaseflowctl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending migrations
    Migrate,

    /// Insert demo jobs spread over two channel contexts
    Seed {
        kind: QueueKindName,
        #[arg(default_value_t = 10)]
        n: u32,
    },

    /// Print per-status counts and runnable depth
    Stats { kind: QueueKindName },

    /// Print one job as JSON
    Show { kind: QueueKindName, id: Uuid },

    /// Run one watchdog pass now
    Reclaim {
        kind: QueueKindName,
        /// Lease TTL override; defaults to the kind's TTL
        #[arg(long)]
        ttl_secs: Option<i64>,
    },

    /// Cancel a waiting job
    Cancel { kind: QueueKindName, id: Uuid },

    /// Give a terminally failed job more attempts
    Grant {
        kind: QueueKindName,
        id: Uuid,
        #[arg(default_value_t = 1)]
        extra: i32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init();

    let cli = Cli::parse();

    let url = std::env::var("DATABASE_URL")
        .or_else(|_| std::env::var("TEST_DATABASE_URL"))
        .context("DATABASE_URL or TEST_DATABASE_URL must be set")?;
    let pool = db::make_pool(&url, &PoolSettings::from_env()).await?;
    let now = Utc::now();

    match cli.command {
        Commands::Migrate => {
            db::run_migrations(&pool).await?;
            println!("migrations applied");
        }
        Commands::Seed { kind, n } => {
            let contexts = ContextsRepo::new(pool.clone());
            let keys = [
                HomogeneityKey::new("demo-account-a", "bookings"),
                HomogeneityKey::new("demo-account-b", "bookings"),
            ];
            for key in &keys {
                let base_url = format!("https://{}.channel.test", key.credential_key);
                contexts
                    .upsert_context(key, &base_url, &json!({ "timeout_ms": 5000 }), true)
                    .await?;
            }

            let store = store_for(kind, pool.clone());
            for i in 0..n {
                let key = &keys[i as usize % keys.len()];
                let job = NewJob::new(Uuid::now_v7())
                    .context(key.credential_key.clone(), key.endpoint.clone())
                    .job_type(if i % 2 == 0 { "ical" } else { "api" })
                    .payload(json!({ "seq": i }));
                let id = store.enqueue(job).await?;
                println!("+ {kind} job {id} ({key})");
            }
        }
        Commands::Stats { kind } => {
            let stats = store_for(kind, pool.clone()).stats(now).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Show { kind, id } => match store_for(kind, pool.clone()).get_job(id).await? {
            Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
            None => anyhow::bail!("{kind} job {id} not found"),
        },
        Commands::Reclaim { kind, ttl_secs } => {
            let ttl = ttl_secs.unwrap_or_else(|| kind.default_lease_ttl_secs());
            let watchdog = Watchdog::new(Duration::seconds(ttl));
            let store = store_for(kind, pool.clone());
            let ids = watchdog.run(store.as_ref(), now).await?;
            println!("reclaimed {} {kind} job(s)", ids.len());
        }
        Commands::Cancel { kind, id } => {
            let done = store_for(kind, pool.clone()).cancel(id, now).await?;
            if !done {
                anyhow::bail!("{kind} job {id} is not waiting (or does not exist)");
            }
            println!("cancelled {id}");
        }
        Commands::Grant { kind, id, extra } => {
            let done = store_for(kind, pool.clone())
                .grant_attempts(id, extra, now)
                .await?;
            if !done {
                anyhow::bail!("{kind} job {id} is not terminally failed (or extra <= 0)");
            }
            println!("granted {extra} more attempt(s) to {id}");
        }
    }

    Ok(())
}
