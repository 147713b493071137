use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use fairq_core::{telemetry, FairQueue, FairQueueConfig, OpsError, RedisStorage};

#[derive(Parser)]
#[command(name = "fairq", about = "FairQueue monitor and repair CLI")]
struct Cli {
    /// Redis connection URL
    #[arg(long, default_value = "redis://127.0.0.1:6379", global = true)]
    redis_url: String,

    /// Master index shard count of the target deployment. Must match the
    /// queue's configuration or reclaimed items land in the wrong shard.
    #[arg(long, default_value = "8", global = true)]
    shards: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a tenant's queue, in-flight, and scheduling state
    Inspect {
        /// Tenant id
        tenant: String,
    },

    /// Show a tenant's outstanding concurrency token count
    Tokens {
        /// Tenant id
        tenant: String,
    },

    /// List master-index entries whose tenant has no pending work
    Stale {
        /// Shard to scan
        #[arg(long)]
        shard: u32,
    },

    /// Drop a leaked concurrency token
    ForceRelease {
        /// Tenant id
        tenant: String,

        /// Token id as shown in the token set
        token: String,
    },

    /// Return an in-flight item to its tenant queue regardless of expiry
    ForceReclaim {
        /// Item id
        item_id: String,
    },

    /// Set or clear a tenant's concurrency limit override
    SetLimit {
        /// Tenant id
        tenant: String,

        /// New limit; omit together with --clear to remove the override
        #[arg(long, conflicts_with = "clear")]
        limit: Option<u64>,

        /// Remove the override, falling back to the default limit
        #[arg(long)]
        clear: bool,
    },
}

fn connect(redis_url: &str, shards: u32) -> FairQueue {
    let storage = match RedisStorage::connect(redis_url) {
        Ok(storage) => storage,
        Err(e) => {
            eprintln!("Error: cannot connect to Redis at {redis_url}: {e}");
            process::exit(1);
        }
    };
    let mut config = FairQueueConfig::default();
    config.scheduler.shard_count = shards;
    FairQueue::new(Arc::new(storage), config)
}

fn cmd_inspect(engine: &FairQueue, tenant: String) {
    match engine.tenant_stats(&tenant) {
        Ok(stats) => {
            println!("Tenant: {tenant}");
            println!("  Pending:   {}", stats.pending);
            println!("  In-flight: {}", stats.in_flight);
            println!("  Deficit:   {}", stats.deficit);
            println!("  Limit:     {}", stats.limit);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

fn cmd_tokens(engine: &FairQueue, tenant: String) {
    match engine.tenant_stats(&tenant) {
        Ok(stats) => println!("{}", stats.in_flight),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

fn cmd_stale(engine: &FairQueue, shard: u32) {
    match engine.stale_entries(shard) {
        Ok(entries) => {
            if entries.is_empty() {
                println!("No stale entries in shard {shard}.");
                return;
            }
            let tenant_width = entries
                .iter()
                .map(|e| e.tenant_id.len())
                .max()
                .unwrap_or(6)
                .max(6);
            println!(
                "{:<tenant_width$}  {:>7}  {:>8}  {:>6}",
                "TENANT", "PENDING", "DEFICIT", "TOKENS"
            );
            for e in &entries {
                println!(
                    "{:<tenant_width$}  {:>7}  {:>8}  {:>6}",
                    e.tenant_id, e.pending, e.deficit, e.tokens
                );
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

fn cmd_force_release(engine: &FairQueue, tenant: String, token: String) {
    match engine.force_release_token(&tenant, &token) {
        Ok(true) => println!("Released token \"{token}\" of tenant \"{tenant}\""),
        Ok(false) => {
            eprintln!("Error: tenant \"{tenant}\" does not hold token \"{token}\"");
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

fn cmd_force_reclaim(engine: &FairQueue, item_id: String) {
    match engine.force_reclaim(&item_id) {
        Ok(tenant) => println!("Reclaimed item \"{item_id}\" back to tenant \"{tenant}\""),
        Err(OpsError::ClaimNotFound(_)) => {
            eprintln!("Error: no in-flight claim found for item \"{item_id}\"");
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

fn cmd_set_limit(engine: &FairQueue, tenant: String, limit: Option<u64>, clear: bool) {
    if limit.is_none() && !clear {
        eprintln!("Error: pass --limit <N> or --clear");
        process::exit(1);
    }
    match engine.set_concurrency_limit(&tenant, limit) {
        Ok(()) => match limit {
            Some(limit) => println!("Set concurrency limit of \"{tenant}\" to {limit}"),
            None => println!("Cleared concurrency limit override of \"{tenant}\""),
        },
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

fn main() {
    // Repairs are logged as warnings; make sure they land somewhere.
    telemetry::init_tracing();

    let cli = Cli::parse();
    let engine = connect(&cli.redis_url, cli.shards);

    match cli.command {
        Commands::Inspect { tenant } => cmd_inspect(&engine, tenant),
        Commands::Tokens { tenant } => cmd_tokens(&engine, tenant),
        Commands::Stale { shard } => cmd_stale(&engine, shard),
        Commands::ForceRelease { tenant, token } => cmd_force_release(&engine, tenant, token),
        Commands::ForceReclaim { item_id } => cmd_force_reclaim(&engine, item_id),
        Commands::SetLimit {
            tenant,
            limit,
            clear,
        } => cmd_set_limit(&engine, tenant, limit, clear),
    }
}
