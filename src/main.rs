//! # LeadPulse
//!
//! Runs the scheduled-task dispatcher and the autopilot decision loop, and
//! exposes the scheduling operations on the command line.
//!
//! Usage:
//!   leadpulse run                                  # Dispatcher (+ autopilot if enabled)
//!   leadpulse schedule --owner acme --type send-email --payload '{...}'
//!   leadpulse enroll --contact <id> --campaign welcome
//!   leadpulse stats                                # Queue and campaign health as JSON
//!   leadpulse decide --snapshot crm.json           # One autopilot pass, dry
//!   leadpulse pending                              # Decisions awaiting approval
//!   leadpulse approve <decision-id>                # Picked up by the next autopilot pass

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use leadpulse_autopilot::{
    ApplyDecisionAction, DecisionEngine, DecisionExecutor, JsonFileSource, SnapshotSource,
    TaskQueueExecutor, run_once, spawn_autopilot,
};
use leadpulse_core::{Clock, LeadPulseConfig, SystemClock};
use leadpulse_scheduler::{
    CampaignCatalog, CustomHandler, Dispatcher, HandlerRegistry, Inspector, ResponseOutcome,
    SchedulerDb, SchedulerService, TaskType, provider_from_config, spawn_dispatcher,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Owner id used for tasks the autopilot enqueues.
const AUTOPILOT_OWNER: &str = "autopilot";

#[derive(Parser)]
#[command(
    name = "leadpulse",
    version,
    about = "📬 LeadPulse: scheduled outreach and drip campaign engine"
)]
struct Cli {
    /// Config file (default: ~/.leadpulse/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file and exit
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Run the dispatcher loop (and the autopilot when enabled)
    Run {
        /// Lease holder name for single-active-dispatcher mode
        #[arg(long)]
        instance_id: Option<String>,
    },
    /// Queue a task
    Schedule {
        #[arg(long)]
        owner: String,
        /// send-email | send-notification | update-lead-score | custom
        #[arg(long = "type")]
        task_type: String,
        /// JSON object
        #[arg(long, default_value = "{}")]
        payload: String,
        /// RFC 3339 time; defaults to now
        #[arg(long)]
        at: Option<String>,
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Create a contact
    AddContact {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        first_name: Option<String>,
    },
    /// Enroll a contact in a drip campaign
    Enroll {
        #[arg(long)]
        contact: String,
        #[arg(long)]
        campaign: String,
    },
    /// Mark an enrollment as responded; no further steps are sent
    Respond { enrollment: String },
    /// Cancel a pending task
    CancelTask { id: String },
    /// Cancel an enrollment and its queued steps
    CancelEnrollment { id: String },
    /// Print queue and campaign health as JSON
    Stats {
        /// Look-ahead for upcoming tasks, in minutes
        #[arg(long, default_value = "60")]
        window_mins: i64,
        /// Max failed tasks to list
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Run one autopilot pass and print the decisions
    Decide {
        /// CRM snapshot JSON (default: autopilot.snapshot_path)
        #[arg(long)]
        snapshot: Option<String>,
        /// Record the decisions and queue the confident ones for execution
        #[arg(long)]
        execute: bool,
    },
    /// List decisions awaiting approval
    Pending,
    /// Approve a held decision; the next autopilot pass applies it
    Approve { id: String },
    /// Reject a held decision
    Reject { id: String },
    /// Print the most recent decisions
    Decisions {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn load_config(cli: &Cli) -> Result<(LeadPulseConfig, PathBuf)> {
    let path = match &cli.config {
        Some(p) => expand_path(p),
        None => LeadPulseConfig::default_path(),
    };
    let config = if path.exists() {
        LeadPulseConfig::load_from(&path)?
    } else {
        tracing::debug!("No config at {}, using defaults", path.display());
        LeadPulseConfig::default()
    };
    Ok((config, path))
}

/// Everything a command needs, wired from one config.
struct App {
    config: LeadPulseConfig,
    db: Arc<SchedulerDb>,
    catalog: Arc<CampaignCatalog>,
    clock: Arc<dyn Clock>,
    service: Arc<SchedulerService>,
}

impl App {
    fn open(config: LeadPulseConfig) -> Result<Self> {
        let db_path = config.db_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Arc::new(
            SchedulerDb::open(&db_path)
                .with_context(|| format!("opening {}", db_path.display()))?,
        );
        let catalog = Arc::new(CampaignCatalog::from_config(&config.campaigns));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let service = Arc::new(
            SchedulerService::new(db.clone(), catalog.clone(), clock.clone())
                .with_default_max_retries(config.retry.default_max_retries),
        );
        Ok(Self {
            config,
            db,
            catalog,
            clock,
            service,
        })
    }

    fn dispatcher(&self, instance_id: String) -> Result<Dispatcher> {
        let provider = provider_from_config(&self.config.delivery)?;
        let custom = CustomHandler::new().with_action(Arc::new(ApplyDecisionAction::new(
            provider.clone(),
            self.config.autopilot.operator.clone(),
        )));
        let handlers = HandlerRegistry::standard(
            self.db.clone(),
            self.catalog.clone(),
            provider,
            custom,
        );
        let lease = chrono::Duration::seconds(self.config.scheduler.leader_lease_secs as i64);
        Ok(Dispatcher::new(
            self.db.clone(),
            handlers,
            self.catalog.clone(),
            self.clock.clone(),
        )
        .configured(&self.config)
        .with_leader_lease(instance_id, lease))
    }

    fn snapshot_source(&self, explicit: Option<&str>) -> Result<Arc<dyn SnapshotSource>> {
        let path = explicit
            .map(str::to_string)
            .or_else(|| self.config.autopilot.snapshot_path.clone())
            .context("no snapshot given and autopilot.snapshot_path is not set")?;
        Ok(Arc::new(JsonFileSource::new(expand_path(&path))))
    }

    fn engine(&self) -> DecisionEngine {
        DecisionEngine::from_config(&self.config.autopilot, self.db.clone(), self.clock.clone())
    }

    fn executor(&self) -> Arc<dyn DecisionExecutor> {
        Arc::new(TaskQueueExecutor::new(
            self.service.clone(),
            AUTOPILOT_OWNER,
            self.clock.clone(),
        ))
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_time(at: Option<&str>) -> Result<DateTime<Utc>> {
    match at {
        Some(s) => Ok(DateTime::parse_from_rfc3339(s)
            .with_context(|| format!("invalid --at '{s}', expected RFC 3339"))?
            .with_timezone(&Utc)),
        None => Ok(Utc::now()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "leadpulse=debug,leadpulse_scheduler=debug,leadpulse_autopilot=debug"
    } else {
        "leadpulse=info,leadpulse_scheduler=info,leadpulse_autopilot=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let (config, config_path) = load_config(&cli)?;

    if let Command::Init { force } = &cli.command {
        if config_path.exists() && !force {
            println!("⚠️  {} already exists (use --force to overwrite)", config_path.display());
        } else {
            LeadPulseConfig::default().save_to(&config_path)?;
            println!("✅ Wrote {}", config_path.display());
        }
        return Ok(());
    }

    let app = App::open(config)?;

    match cli.command {
        Command::Init { .. } => {}
        Command::Run { instance_id } => run(app, instance_id).await?,
        Command::Schedule {
            owner,
            task_type,
            payload,
            at,
            max_retries,
        } => {
            let task_type: TaskType = task_type.parse()?;
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload is not valid JSON")?;
            let at = parse_time(at.as_deref())?;
            let id = app
                .service
                .schedule_task(&owner, task_type, payload, at, max_retries)?;
            println!("{id}");
        }
        Command::AddContact {
            owner,
            email,
            first_name,
        } => {
            let contact = app
                .service
                .add_contact(&owner, &email, first_name.as_deref())?;
            print_json(&contact)?;
        }
        Command::Enroll { contact, campaign } => {
            let id = app.service.enroll(&contact, &campaign)?;
            println!("{id}");
        }
        Command::Respond { enrollment } => {
            match app.service.record_response(&enrollment)? {
                ResponseOutcome::Recorded => {
                    println!("✅ Enrollment {enrollment} marked as responded")
                }
                ResponseOutcome::AlreadyResponded(at) => {
                    println!("ℹ️  Enrollment {enrollment} already responded at {at}")
                }
            }
        }
        Command::CancelTask { id } => {
            let outcome = app.service.cancel_task(&id)?;
            print_json(&serde_json::json!({ "task_id": id, "outcome": outcome }))?;
        }
        Command::CancelEnrollment { id } => {
            if app.service.cancel_enrollment(&id)? {
                println!("✅ Enrollment {id} cancelled");
            } else {
                println!("⚠️  Enrollment {id} is not active");
            }
        }
        Command::Stats { window_mins, limit } => {
            let inspector = Inspector::new(app.db.clone(), app.catalog.clone(), app.clock.clone());
            let window = chrono::Duration::minutes(window_mins.max(0));
            print_json(&serde_json::json!({
                "status_counts": inspector.status_counts()?,
                "due_soon": inspector.due_soon(window)?,
                "retry_exhausted": inspector.retry_exhausted(limit)?,
                "failed": inspector.failed_tasks(limit)?,
                "steps": inspector.step_distribution()?,
                "stuck_enrollments": inspector.stuck_enrollments(window)?,
            }))?;
        }
        Command::Decide { snapshot, execute } => {
            let source = app.snapshot_source(snapshot.as_deref())?;
            if execute {
                let engine = app.engine();
                let report = run_once(&engine, source.as_ref(), app.executor().as_ref()).await?;
                print_json(&serde_json::json!({
                    "report": report,
                    "decisions": engine.history(report.proposed)?,
                }))?;
            } else {
                // evaluated against a scratch store so nothing is recorded
                let scratch = Arc::new(SchedulerDb::open_in_memory()?);
                let engine = DecisionEngine::from_config(&app.config.autopilot, scratch, app.clock.clone());
                let snapshot = source.snapshot().await?;
                print_json(&engine.evaluate(&snapshot)?)?;
            }
        }
        Command::Pending => print_json(&app.engine().pending_approval()?)?,
        Command::Approve { id } => {
            let decision = app.engine().approve(&id)?;
            println!("✅ Decision {id} ({}) approved", decision.decision_type);
        }
        Command::Reject { id } => {
            let decision = app.engine().reject(&id)?;
            println!("🚫 Decision {id} ({}) rejected", decision.decision_type);
        }
        Command::Decisions { limit } => print_json(&app.engine().history(limit)?)?,
    }

    Ok(())
}

async fn run(app: App, instance_id: Option<String>) -> Result<()> {
    let instance_id = instance_id
        .or_else(|| app.config.scheduler.instance_id.clone())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let dispatcher = Arc::new(app.dispatcher(instance_id.clone())?);
    let tick_every = std::time::Duration::from_secs(app.config.scheduler.tick_secs);

    println!("📬 LeadPulse v{}", env!("CARGO_PKG_VERSION"));
    println!("   🗄️  Database:   {}", app.config.db_path().display());
    println!("   🆔 Instance:   {instance_id}");
    println!("   ⏱️  Tick:       {}s", app.config.scheduler.tick_secs);
    println!("   📚 Campaigns:  {}", app.catalog.names().join(", "));
    println!(
        "   📤 Delivery:   {}",
        if app.config.delivery.dry_run { "dry-run" } else { "live" }
    );
    println!();

    let autopilot = if app.config.autopilot.enabled {
        let source = app.snapshot_source(None)?;
        let engine = Arc::new(app.engine());
        let every = std::time::Duration::from_secs(app.config.autopilot.interval_secs.max(1));
        Some(tokio::spawn(spawn_autopilot(engine, source, app.executor(), every)))
    } else {
        None
    };

    tokio::select! {
        _ = spawn_dispatcher(dispatcher.clone(), tick_every) => {}
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("🛑 Shutting down");
        }
    }

    if let Some(handle) = autopilot {
        handle.abort();
    }
    dispatcher.release_lease()?;
    Ok(())
}
