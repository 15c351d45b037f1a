//! Scout: scheduled collection for tracked social profiles
//!
//! Main binary with subcommands:
//! - `daemon`: Periodic scheduler loop
//! - `dispatch`, `scrape`, `analyze`, `retry`: One-shot workflow runs
//! - `jobs`, `profiles`: Inspect and manage stored state

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scout_store::{JobStatus, JobType, ProfileId, TrackingFrequency};
use scout_workflow::WorkflowConfig;

mod commands;
mod daemon;

#[derive(Parser)]
#[command(name = "scout")]
#[command(about = "Scheduled collection for tracked social profiles", long_about = None)]
struct Cli {
    /// SQLite database path
    #[arg(long, env = "SCOUT_DB_PATH", default_value = "scout.db", global = true)]
    db: PathBuf,

    #[command(flatten)]
    workflow: WorkflowArgs,

    #[command(subcommand)]
    command: Commands,
}

/// How to invoke the external collection workflow.
#[derive(Args, Debug)]
struct WorkflowArgs {
    /// Workflow program
    #[arg(long, env = "SCOUT_WORKFLOW_PROGRAM", default_value = "npx", global = true)]
    workflow_program: String,

    /// Arguments placed before the operation (repeatable, comma separated)
    #[arg(
        long = "workflow-arg",
        env = "SCOUT_WORKFLOW_ARGS",
        value_delimiter = ',',
        default_value = "tsx,src/workflow-tracker.ts",
        global = true
    )]
    workflow_args: Vec<String>,

    /// Working directory for the workflow (defaults to the current one)
    #[arg(long, env = "SCOUT_WORKFLOW_DIR", global = true)]
    workflow_dir: Option<PathBuf>,

    /// Batch timeout in seconds
    #[arg(long, default_value = "600", global = true)]
    batch_timeout: u64,

    /// Single-profile timeout in seconds
    #[arg(long, default_value = "300", global = true)]
    single_timeout: u64,

    /// Analysis timeout in seconds
    #[arg(long, default_value = "600", global = true)]
    analysis_timeout: u64,
}

impl WorkflowArgs {
    fn config(&self) -> WorkflowConfig {
        let mut config = WorkflowConfig::new(&self.workflow_program, self.workflow_args.clone())
            .with_batch_timeout(Duration::from_secs(self.batch_timeout))
            .with_single_timeout(Duration::from_secs(self.single_timeout))
            .with_analysis_timeout(Duration::from_secs(self.analysis_timeout));
        if let Some(dir) = &self.workflow_dir {
            config = config.with_working_dir(dir);
        }
        config
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler loop until interrupted
    Daemon {
        /// Seconds between scheduler cycles
        #[arg(long, default_value = "300")]
        check_interval: u64,

        /// Maximum profiles per batch
        #[arg(long, default_value = "10")]
        batch_size: usize,
    },

    /// Dispatch one batch now
    Dispatch {
        /// Profile ids to dispatch regardless of schedule (default: the due set)
        #[arg(long, value_delimiter = ',')]
        ids: Option<Vec<ProfileId>>,

        /// Maximum profiles per batch when no ids are given
        #[arg(long, default_value = "10")]
        batch_size: usize,
    },

    /// Collect a single profile now
    Scrape {
        profile_id: ProfileId,

        /// Job type to record (full, profile, posts)
        #[arg(long, default_value = "full")]
        job_type: JobType,
    },

    /// Run content analysis over collected items
    Analyze {
        /// Maximum items to analyze
        #[arg(long, default_value = "50")]
        limit: u32,
    },

    /// Retry a failed single-profile job
    Retry { job_id: i64 },

    /// List recent jobs as JSON lines
    Jobs {
        /// Only jobs in this status (pending, running, completed, failed)
        #[arg(long)]
        status: Option<JobStatus>,

        /// Only jobs for this profile
        #[arg(long)]
        profile: Option<ProfileId>,

        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Manage tracked profiles
    Profiles {
        #[command(subcommand)]
        command: ProfileCommands,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// Start tracking a profile
    Add {
        #[arg(long)]
        url: String,

        #[arg(long)]
        name: String,

        /// 1 (lowest) to 10 (highest)
        #[arg(long, default_value = "5")]
        priority: i32,

        /// hourly, daily, or weekly
        #[arg(long, default_value = "daily")]
        frequency: TrackingFrequency,
    },

    /// List profiles as JSON lines
    List {
        /// Include paused profiles
        #[arg(long)]
        all: bool,
    },

    /// Stop scheduling a profile
    Pause { id: ProfileId },

    /// Resume scheduling a profile
    Resume { id: ProfileId },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| {
                "scout=info,scout_scheduler=info,scout_workflow=info,scout_store=info".to_string()
            }),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let store = commands::open_store(&cli.db)?;
    let workflow = cli.workflow.config();
    let mut out = std::io::stdout().lock();

    match cli.command {
        Commands::Daemon {
            check_interval,
            batch_size,
        } => daemon::run(store, workflow, check_interval, batch_size).await,

        Commands::Dispatch { ids, batch_size } => {
            let scheduler = commands::scheduler(store, workflow, batch_size);
            commands::dispatch(&scheduler, ids, &mut out).await
        }

        Commands::Scrape {
            profile_id,
            job_type,
        } => {
            let scheduler = commands::scheduler(store, workflow, scout_scheduler::DEFAULT_BATCH_SIZE);
            commands::scrape(&scheduler, profile_id, job_type, &mut out).await
        }

        Commands::Analyze { limit } => {
            let scheduler = commands::scheduler(store, workflow, scout_scheduler::DEFAULT_BATCH_SIZE);
            commands::analyze(&scheduler, limit, &mut out).await
        }

        Commands::Retry { job_id } => {
            let scheduler = commands::scheduler(store, workflow, scout_scheduler::DEFAULT_BATCH_SIZE);
            commands::retry(&scheduler, job_id, &mut out).await
        }

        Commands::Jobs {
            status,
            profile,
            limit,
        } => commands::list_jobs(store.as_ref(), status, profile, limit, &mut out),

        Commands::Profiles { command } => match command {
            ProfileCommands::Add {
                url,
                name,
                priority,
                frequency,
            } => commands::add_profile(store.as_ref(), url, name, priority, frequency, &mut out),
            ProfileCommands::List { all } => {
                commands::list_profiles(store.as_ref(), !all, &mut out)
            }
            ProfileCommands::Pause { id } => commands::set_active(store.as_ref(), id, false),
            ProfileCommands::Resume { id } => commands::set_active(store.as_ref(), id, true),
        },
    }
}
