//! Telos - autonomous goal lifecycle orchestrator.
//!
//! Seeds missions, runs the heartbeat daemon, and exposes operator
//! commands for auditing and approvals.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use telos::config::Config;
use telos::contract::ContractValidator;
use telos::decompose::{DecompositionService, HeuristicOracle};
use telos::execute::{ExecutionService, SkillRegistry};
use telos::goal::{CompletionApproval, Goal};
use telos::invariants::InvariantAuditor;
use telos::safety::{ConstraintType, SafetyConstraint, SafetyService};
use telos::scheduler::Scheduler;
use telos::store::Store;

#[derive(Parser, Debug)]
#[command(name = "telos")]
#[command(about = "Autonomous goal lifecycle orchestrator")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the heartbeat daemon
    Run,
    /// Seed a depth-0 mission goal
    Seed {
        /// Mission title
        title: String,
        /// Longer description
        #[arg(short, long, default_value = "")]
        description: String,
        /// Goal type (achievable, continuous, directional, exploratory, meta)
        #[arg(short, long, default_value = "achievable")]
        goal_type: String,
        /// Seed as an atomic leaf instead of a decomposable mission
        #[arg(long)]
        atomic: bool,
    },
    /// Run the invariants audit and print the findings
    Audit,
    /// Print orchestrator stats
    Stats,
    /// Record a completion approval for a manual-mode goal
    Approve {
        /// Goal id
        goal_id: String,
        /// Who is approving
        #[arg(long, default_value = "operator")]
        by: String,
        /// Optional comment
        #[arg(long, default_value = "")]
        comment: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let config = Config::load_or_init()?;
    let store = Arc::new(Store::open(&config.workspace_dir)?);
    store.with_uow(|uow| {
        // Config-file limits land first so they win over the shipped
        // defaults; rows already in the store win over both.
        for (name, limit) in &config.safety.limits {
            let constraint_type: ConstraintType = name.parse()?;
            if uow.get_constraint(constraint_type)?.is_none() {
                uow.upsert_constraint(&SafetyConstraint {
                    constraint_type,
                    limit: *limit,
                    enabled: true,
                })?;
            }
        }
        SafetyService::seed_defaults(uow)
    })?;

    match args.command {
        Command::Run => {
            let execution = Arc::new(ExecutionService::new(Arc::new(
                SkillRegistry::with_builtins(),
            )));
            let decomposition = Arc::new(DecompositionService::new(
                Arc::new(HeuristicOracle),
                Duration::from_secs(config.oracle.timeout_secs),
            ));
            let scheduler = Scheduler::new(store, execution, decomposition, config.scheduler);
            scheduler.run().await?;
        }
        Command::Seed {
            title,
            description,
            goal_type,
            atomic,
        } => {
            let contract = ContractValidator::default_contract_for(&goal_type, 0)?;
            let goal = Goal::new(title, description, goal_type.parse()?, None, atomic, contract);
            let id = goal.id.clone();
            store.with_uow(|uow| uow.insert_goal(&goal))?;
            info!("seeded mission {id}");
            println!("{id}");
        }
        Command::Audit => {
            let report = store.with_uow(|uow| Ok(InvariantAuditor::audit(uow)))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.clean() {
                std::process::exit(1);
            }
        }
        Command::Stats => {
            let stats = store.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Approve {
            goal_id,
            by,
            comment,
        } => {
            let inserted = store.with_uow(|uow| {
                uow.insert_approval(&CompletionApproval {
                    goal_id: goal_id.clone(),
                    approved_by: by,
                    authority_level: "operator".to_string(),
                    comment,
                    approved_at: chrono::Utc::now(),
                })
            })?;
            if inserted {
                println!("approved {goal_id}");
            } else {
                println!("{goal_id} was already approved");
            }
        }
    }

    Ok(())
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("telos={level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}
