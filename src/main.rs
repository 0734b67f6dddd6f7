use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{StoreBackend, TollgateConfig};
use tollgate::ratelimit::{Algorithm, Decision, Limiter, PolicySet};
use tollgate::store::{AtomicStore, MemoryStore, RedisStore};

const MEMORY_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Check and reset rate limits against a shared store.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<String>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check whether events for a key are allowed now
    Allow {
        /// Policy name from the configuration
        policy: String,
        /// Logical key, e.g. "api_gateway:user_1"
        key: String,
        /// Number of events (GCRA only)
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u64,
    },
    /// Delete the state of a key
    Reset { policy: String, key: String },
    /// List configured policies
    Policies,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = TollgateConfig::load(cli.config.as_deref())?;
    info!(
        backend = ?config.store.backend,
        prefix = %config.limiter.prefix,
        policies = config.policies.len(),
        "Configuration loaded"
    );

    match config.store.backend {
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.store.redis_url).await?;
            if config.store.preload_scripts {
                store.preload().await?;
            }
            run(Limiter::with_prefix(store, &config.limiter.prefix), &config.policies, &cli).await
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store; state is not shared with other processes");
            let store = Arc::new(MemoryStore::new());
            store.spawn_purge(MEMORY_PURGE_INTERVAL);
            run(Limiter::with_prefix(store, &config.limiter.prefix), &config.policies, &cli).await
        }
    }
}

async fn run<S: AtomicStore>(limiter: Limiter<S>, policies: &PolicySet, cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Command::Allow { policy, key, count } => {
            let limit = policies.limit(policy)?;
            let decision = limiter.allow_n(key, &limit, *count).await?;
            print_decision(&decision, cli.json);
        }
        Command::Reset { policy, key } => {
            let limit = policies.limit(policy)?;
            limiter.reset(key, &limit).await?;
            if cli.json {
                println!("{}", serde_json::json!({ "reset": true, "key": key, "policy": policy }));
            } else {
                println!("reset {} under {}", key, policy);
            }
        }
        Command::Policies => {
            for (name, rule) in policies.iter() {
                let limit = rule.to_limit()?;
                if cli.json {
                    println!(
                        "{}",
                        serde_json::json!({
                            "name": name,
                            "algorithm": limit.algorithm.name(),
                            "rate": limit.rate,
                            "period_secs": limit.period.as_secs_f64(),
                            "burst": limit.burst,
                            "emission_interval_secs": limit.emission_interval().map(|d| d.as_secs_f64()),
                        })
                    );
                } else {
                    match limit.algorithm {
                        Algorithm::Gcra => println!(
                            "{}: {} {} per {:?} (burst {}, one event every {})",
                            name,
                            limit.algorithm,
                            limit.rate,
                            limit.period,
                            limit.burst,
                            fmt_duration(limit.emission_interval())
                        ),
                        Algorithm::SlidingWindow => println!(
                            "{}: {} {} per {:?}",
                            name, limit.algorithm, limit.rate, limit.period
                        ),
                    }
                }
            }
        }
    }
    Ok(())
}

fn print_decision(decision: &Decision, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::json!({
                "key": decision.key,
                "allowed": decision.allowed,
                "remaining": decision.remaining,
                "retry_after_secs": decision.retry_after.map(|d| d.as_secs_f64()),
                "reset_after_secs": decision.reset_after.map(|d| d.as_secs_f64()),
            })
        );
        return;
    }

    println!(
        "{} allowed={} remaining={} retry_after={} reset_after={}",
        decision.key,
        decision.allowed,
        decision.remaining,
        fmt_duration(decision.retry_after),
        fmt_duration(decision.reset_after)
    );
}

fn fmt_duration(duration: Option<Duration>) -> String {
    duration.map_or_else(|| "-".to_string(), |d| format!("{:?}", d))
}
