//! Operations CLI for the AEGIS control plane.
//!
//! Talks to the database directly, so it runs from the same network
//! position as the server. Exit codes: 0 success, 1 runtime error,
//! 2 invariant violation.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use uuid::Uuid;

use aegis::config::Config;
use aegis::crypto::signing::ControlPlaneSigner;
use aegis::database::Database;
use aegis::evidence::EvidenceChain;
use aegis::learning::{PromotionController, RuleSyncService};
use aegis::orders::{NewOrder, OrderKind, OrderManager};
use aegis::rollout::{RolloutController, RolloutStage};
use aegis::storage::MinioObjectStore;

#[derive(Parser)]
#[command(name = "aegisctl", about = "AEGIS control plane operations", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Order operations
    Order {
        #[command(subcommand)]
        command: OrderCommand,
    },
    /// Rollout operations
    Rollout {
        #[command(subcommand)]
        command: RolloutCommand,
    },
    /// Release operations
    Release {
        #[command(subcommand)]
        command: ReleaseCommand,
    },
    /// Evidence chain operations
    Evidence {
        #[command(subcommand)]
        command: EvidenceCommand,
    },
    /// Chain repair
    Chain {
        #[command(subcommand)]
        command: ChainCommand,
    },
    /// Pattern operations
    Pattern {
        #[command(subcommand)]
        command: PatternCommand,
    },
}

#[derive(Subcommand)]
enum OrderCommand {
    /// Create and sign an order
    Create {
        /// Target appliance (omit for fleet orders)
        #[arg(long)]
        appliance: Option<String>,
        /// Command type
        #[arg(long = "type")]
        command_type: String,
        /// JSON parameters
        #[arg(long, default_value = "{}")]
        params: String,
        /// TTL in seconds
        #[arg(long, default_value_t = 3600)]
        ttl: i64,
        /// Issue as a fleet order
        #[arg(long)]
        fleet: bool,
        /// Fleet orders skip appliances already at this version
        #[arg(long)]
        skip_version: Option<String>,
    },
}

#[derive(Subcommand)]
enum RolloutCommand {
    /// Start a staged rollout
    Start {
        /// Release version
        #[arg(long)]
        release: String,
        /// Campaign name
        #[arg(long)]
        name: String,
        /// Stage plan JSON, e.g. '[{"percent":5,"delay_hours":24}]'
        #[arg(long)]
        stages: String,
        /// Failure threshold percent
        #[arg(long, default_value_t = 10.0)]
        threshold: f64,
        /// Disable automatic rollback
        #[arg(long)]
        no_rollback: bool,
    },
    /// Pause an active rollout
    Pause {
        /// Rollout id
        id: Uuid,
    },
    /// Cancel a rollout
    Cancel {
        /// Rollout id
        id: Uuid,
    },
}

#[derive(Subcommand)]
enum ReleaseCommand {
    /// Mark a release as the advertised latest
    MarkLatest {
        /// Release version
        version: String,
    },
}

#[derive(Subcommand)]
enum EvidenceCommand {
    /// Verify a site's chain end to end
    Verify {
        /// Site id
        #[arg(long)]
        site: String,
    },
}

#[derive(Subcommand)]
enum ChainCommand {
    /// Rebuild a site's chain metadata
    Repair {
        /// Site id
        #[arg(long)]
        site: String,
    },
}

#[derive(Subcommand)]
enum PatternCommand {
    /// Scan cross-client patterns and auto-promote qualifiers
    Scan {
        /// Run the platform-wide scan
        #[arg(long)]
        platform: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(invariant_ok) => {
            if invariant_ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            }
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns `Ok(false)` when the command completed but found an invariant
/// violation (exit code 2).
async fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = Config::from_env()?;

    let signer = match &config.signing_key_hex {
        Some(seed_hex) => ControlPlaneSigner::from_seed_hex(seed_hex)?,
        None => ControlPlaneSigner::generate(),
    };
    ControlPlaneSigner::init_global(signer)?;

    let db = Database::connect(&config).await?;
    let pool = db.pool().clone();

    match cli.command {
        Command::Order { command } => match command {
            OrderCommand::Create {
                appliance,
                command_type,
                params,
                ttl,
                fleet,
                skip_version,
            } => {
                if config.signing_key_hex.is_none() {
                    anyhow::bail!("order create requires AEGIS_SIGNING_KEY");
                }
                let parameters: Value = serde_json::from_str(&params)?;
                let kind = if fleet {
                    OrderKind::Fleet
                } else {
                    OrderKind::Appliance
                };
                if kind == OrderKind::Appliance && appliance.is_none() {
                    anyhow::bail!("--appliance is required unless --fleet is set");
                }

                let orders = OrderManager::new(pool);
                let order = orders
                    .create(NewOrder {
                        kind,
                        appliance_id: appliance,
                        site_id: None,
                        command_type,
                        parameters,
                        runbook_id: None,
                        skip_version,
                        dedup_key: None,
                        ttl: chrono::Duration::seconds(ttl),
                        created_by: "aegisctl".to_string(),
                    })
                    .await?;
                println!("{}", serde_json::to_string_pretty(&order)?);
            }
        },
        Command::Rollout { command } => {
            let store = Arc::new(MinioObjectStore::new(&config.object_store));
            let controller =
                RolloutController::new(pool.clone(), OrderManager::new(pool), store);
            match command {
                RolloutCommand::Start {
                    release,
                    name,
                    stages,
                    threshold,
                    no_rollback,
                } => {
                    let stages: Vec<RolloutStage> = serde_json::from_str(&stages)?;
                    let rollout = controller
                        .start(&release, &name, &stages, threshold, !no_rollback, None, None)
                        .await?;
                    println!("{}", serde_json::to_string_pretty(&rollout)?);
                }
                RolloutCommand::Pause { id } => {
                    controller.pause(id).await?;
                    println!("rollout {id} paused");
                }
                RolloutCommand::Cancel { id } => {
                    controller.cancel(id).await?;
                    println!("rollout {id} cancelled");
                }
            }
        }
        Command::Release { command } => match command {
            ReleaseCommand::MarkLatest { version } => {
                let store = Arc::new(MinioObjectStore::new(&config.object_store));
                let controller =
                    RolloutController::new(pool.clone(), OrderManager::new(pool), store);
                controller.mark_latest(&version).await?;
                println!("release {version} marked latest");
            }
        },
        Command::Evidence { command } => match command {
            EvidenceCommand::Verify { site } => {
                let chain = EvidenceChain::new(pool);
                let verification = chain.verify_chain(&site).await?;
                println!(
                    "site {site}: {} bundles, {}",
                    verification.length,
                    if verification.is_valid() {
                        "chain verifies".to_string()
                    } else {
                        format!("{} breaks", verification.breaks.len())
                    }
                );
                for brk in &verification.breaks {
                    println!("  position {}: {}", brk.position, brk.reason);
                }
                return Ok(verification.is_valid());
            }
        },
        Command::Chain { command } => match command {
            ChainCommand::Repair { site } => {
                let chain = EvidenceChain::new(pool);
                let repaired = chain.repair_chain(&site).await?;
                println!("site {site}: {repaired} rows repaired");
            }
        },
        Command::Pattern { command } => match command {
            PatternCommand::Scan { platform } => {
                if !platform {
                    anyhow::bail!("only --platform scans are supported");
                }
                let promotion = PromotionController::new(pool.clone());
                let rule_sync = RuleSyncService::new(
                    pool.clone(),
                    OrderManager::new(pool),
                    promotion.clone(),
                );
                let promoted = promotion.auto_promote_platform().await?;
                if promoted.is_empty() {
                    println!("no qualifying platform patterns");
                } else {
                    let delivered = rule_sync.deliver_pending().await?;
                    for rule_id in &promoted {
                        println!("promoted {rule_id}");
                    }
                    println!("{delivered} sync orders issued");
                }
            }
        },
    }

    Ok(true)
}
