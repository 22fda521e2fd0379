use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatekeeper::config::GatekeeperConfig;
use gatekeeper::fingerprint::{self, RequestIdentity};
use gatekeeper::lock::new_owner_token;
use gatekeeper::ratelimit::{Algorithm, Decision, LimitPolicy, PolicyTable, RateLimitKey};
use gatekeeper::Gatekeeper;

#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about = "Rate limiting and distributed locks")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the fingerprint of a request
    Fingerprint {
        /// Peer address of the connection
        #[arg(long)]
        ip: Option<String>,
        #[arg(long)]
        user_agent: Option<String>,
        /// Value of the X-Forwarded-For header
        #[arg(long)]
        forwarded_for: Option<String>,
    },
    /// Run admission checks against a key
    Check {
        #[arg(long, default_value = "by-ip")]
        scope: String,
        #[arg(long)]
        identity: String,
        #[arg(long)]
        action: String,
        /// Override the configured limit
        #[arg(long, requires = "window_secs")]
        limit: Option<u64>,
        #[arg(long, requires = "limit")]
        window_secs: Option<u64>,
        /// fixed or sliding
        #[arg(long, default_value = "fixed")]
        algorithm: Algorithm,
        /// Number of attempts to make
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Acquire or release a distributed lock
    Lock {
        #[command(subcommand)]
        action: LockCommand,
    },
}

#[derive(Debug, Subcommand)]
enum LockCommand {
    Acquire {
        #[arg(long)]
        key: String,
        /// Owner token; generated when omitted
        #[arg(long)]
        token: Option<String>,
        /// Override the configured TTL
        #[arg(long)]
        ttl_ms: Option<u64>,
    },
    Release {
        #[arg(long)]
        key: String,
        #[arg(long)]
        token: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn decision_json(key: &RateLimitKey, decision: &Decision) -> serde_json::Value {
    json!({
        "key": key.to_string(),
        "allowed": decision.allowed,
        "limit": decision.limit,
        "remaining": decision.remaining,
        "retry_after_secs": decision.retry_after_secs(),
    })
}

/// The policy for `check`: explicit overrides when given, else the table's.
fn resolve_policy(
    policies: &PolicyTable,
    key: &RateLimitKey,
    limit: Option<u64>,
    window_secs: Option<u64>,
    algorithm: Algorithm,
) -> anyhow::Result<LimitPolicy> {
    let policy = match (limit, window_secs) {
        (Some(limit), Some(window_secs)) => LimitPolicy {
            limit,
            window_secs,
            algorithm,
        },
        _ => policies.for_key(key),
    };
    policy.validate("cli")?;
    Ok(policy)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    if let Command::Fingerprint {
        ip,
        user_agent,
        forwarded_for,
    } = &cli.command
    {
        let mut identity = RequestIdentity::new(ip.clone());
        if let Some(ua) = user_agent {
            identity = identity.with_header("user-agent", ua.clone());
        }
        if let Some(xff) = forwarded_for {
            identity = identity.with_header("x-forwarded-for", xff.clone());
        }
        let output = json!({
            "client_ip": identity.client_ip(),
            "user_agent": identity.user_agent(),
            "fingerprint": fingerprint::derive(&identity).to_string(),
        });
        println!("{output}");
        return Ok(());
    }

    let config = GatekeeperConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    info!(version = env!("CARGO_PKG_VERSION"), store = ?config.store.url, "Starting gatekeeper");
    let gatekeeper = Gatekeeper::connect(config)
        .await
        .context("Failed to connect to the shared store")?;

    match cli.command {
        Command::Fingerprint { .. } => {}
        Command::Check {
            scope,
            identity,
            action,
            limit,
            window_secs,
            algorithm,
            count,
        } => {
            let key = RateLimitKey::new(scope, identity, action);
            let limiter = gatekeeper.limiter();
            let policy = resolve_policy(limiter.policies(), &key, limit, window_secs, algorithm)?;
            for _ in 0..count {
                let decision = limiter.decide(&key, &policy).await;
                println!("{}", decision_json(&key, &decision));
            }
            let metrics = limiter.breaker().metrics();
            info!(state = %metrics.state, failed_calls = metrics.failed_calls, "Breaker state");
        }
        Command::Lock { action } => match action {
            LockCommand::Acquire { key, token, ttl_ms } => {
                let lock = gatekeeper.lock();
                let token = token.unwrap_or_else(new_owner_token);
                let ttl = ttl_ms.map(Duration::from_millis).unwrap_or_else(|| lock.config().ttl());
                let acquired = lock.acquire(&key, &token, ttl).await;
                println!("{}", json!({ "key": key, "token": token, "acquired": acquired }));
            }
            LockCommand::Release { key, token } => {
                let released = gatekeeper.lock().release(&key, &token).await;
                println!("{}", json!({ "key": key, "released": released }));
            }
        },
    }

    Ok(())
}
