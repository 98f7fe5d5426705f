mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::TollgateConfig;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tollgate_backends::{FileDocumentStore, FileQueue, ProcessSandbox};
use tollgate_core::{Clock, SystemClock};
use tollgate_orchestrator::{
    Backends, NewTask, OrchestrationRequest, Orchestrator, TaskDispatchWorker, TaskPayload,
};
use tollgate_worker::{CircuitBreakers, DeadLetterHandler, WorkerConfig, WorkerRunner};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const SANDBOX_CIRCUIT: &str = "sandbox";

#[derive(Parser)]
#[command(name = "tollgate", about = "Tollgate — budget-gated multi-agent delegation")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "tollgate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one request through the orchestrator
    Orchestrate {
        /// Request text
        query: String,
        #[arg(long, default_value = "cli")]
        session: String,
        #[arg(long, default_value = "cli")]
        user: String,
        /// Caller context as a JSON document
        #[arg(long)]
        context: Option<String>,
    },
    /// Queue a task for `serve` to execute
    Submit {
        /// Task content
        content: String,
        #[arg(long, default_value = "cli")]
        session: String,
        #[arg(long, default_value = "cli")]
        conversation: String,
        /// Assign an agent instead of routing
        #[arg(long)]
        agent: Option<String>,
        #[arg(long, default_value = "request")]
        intent: String,
        #[arg(long)]
        priority: Option<i32>,
    },
    /// Inspect tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// List escalations awaiting review
    Escalations,
    /// Approve a pending escalation
    Approve {
        id: Uuid,
        #[arg(long, default_value = "operator")]
        reviewer: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Reject a pending escalation
    Reject {
        id: Uuid,
        #[arg(long, default_value = "operator")]
        reviewer: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Execute an approved escalation
    Resume { id: Uuid },
    /// Show the budget ledger, or one agent's account
    Ledger { agent: Option<String> },
    /// Triage dead-lettered jobs
    DeadLetters {
        #[command(subcommand)]
        action: DeadLetterAction,
    },
    /// Run the task and dead-letter workers until interrupted
    Serve,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Show one task
    Show { id: Uuid },
    /// List a session's tasks
    List { session: String },
    /// Cancel a pending or running task
    Cancel { id: Uuid },
}

#[derive(Subcommand)]
enum DeadLetterAction {
    /// List records awaiting triage
    List {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List raised alerts
    Alerts,
    /// Attach analysis notes
    Analyze {
        id: Uuid,
        #[arg(long)]
        notes: String,
    },
    /// Republish the original job
    Reprocess { id: Uuid },
    /// Give up on a record
    Discard { id: Uuid },
}

struct App {
    config: TollgateConfig,
    orchestrator: Arc<Orchestrator>,
    dead_letters: Arc<DeadLetterHandler>,
    backends: Backends,
}

impl App {
    async fn open(config: TollgateConfig) -> anyhow::Result<Self> {
        let store = Arc::new(FileDocumentStore::new(config.data_dir.join("store")).await?);
        let queue = Arc::new(FileQueue::new(config.data_dir.join("queue")).await?);
        let sandbox = Arc::new(ProcessSandbox::new().with_python(config.sandbox.python.clone()));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let backends = Backends {
            store,
            queue,
            sandbox,
            clock,
        };
        let orchestrator = Arc::new(Orchestrator::new(
            config.orchestrator.clone(),
            config.profiles(),
            backends.clone(),
        )?);
        let dead_letters = Arc::new(DeadLetterHandler::new(
            Arc::clone(&backends.store),
            Arc::clone(&backends.queue),
            Arc::clone(&backends.clock),
            config.dead_letter.clone(),
        ));
        Ok(Self {
            config,
            orchestrator,
            dead_letters,
            backends,
        })
    }

    async fn serve(self) -> anyhow::Result<()> {
        let settings = &self.config.worker;
        let circuits = Arc::new(CircuitBreakers::new(
            settings.circuit_threshold,
            chrono::Duration::seconds(settings.circuit_cool_down_secs),
            Arc::clone(&self.backends.clock),
        ));

        let task_runner = WorkerRunner::new(
            Arc::new(
                TaskDispatchWorker::new(Arc::clone(&self.orchestrator))
                    .with_retry_policy(settings.retry_policy()),
            ),
            WorkerConfig::new(self.orchestrator.tasks().task_topic())
                .with_max_concurrency(settings.max_concurrency)
                .with_poll_interval_ms(settings.poll_interval_ms)
                .with_circuit_id(SANDBOX_CIRCUIT)
                .with_dead_letter_topic(settings.dead_letter_topic.clone()),
            Arc::clone(&self.backends.queue),
            Arc::clone(&self.backends.clock),
        )
        .with_retry_policy(settings.retry_policy())
        .with_circuit_breakers(circuits);

        // Handler failures go to their own topic, never back into its input.
        let dead_letter_runner = WorkerRunner::new(
            Arc::clone(&self.dead_letters),
            WorkerConfig::new(settings.dead_letter_topic.clone())
                .with_poll_interval_ms(settings.poll_interval_ms)
                .with_dead_letter_topic(format!("{}.unprocessable", settings.dead_letter_topic)),
            Arc::clone(&self.backends.queue),
            Arc::clone(&self.backends.clock),
        )
        .with_retry_policy(settings.retry_policy());

        let tasks = Arc::clone(self.orchestrator.tasks());
        let sweep_every = Duration::from_secs(settings.sweep_interval_secs.max(1));
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_every);
            loop {
                interval.tick().await;
                if let Err(e) = tasks.republish_pending_dispatches().await {
                    error!(error = %e, "Dispatch sweep failed");
                }
            }
        });

        let task_handle = task_runner.start();
        let dead_letter_handle = dead_letter_runner.start();
        info!(data_dir = %self.config.data_dir.display(), "Tollgate serving");

        tokio::signal::ctrl_c().await?;
        info!("Shutting down");
        sweeper.abort();
        task_handle.shutdown().await;
        dead_letter_handle.shutdown().await;
        Ok(())
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = TollgateConfig::load(&cli.config).await?;
    let app = App::open(config).await?;

    match cli.command {
        Commands::Orchestrate {
            query,
            session,
            user,
            context,
        } => {
            let context = match context {
                Some(raw) => serde_json::from_str(&raw).context("--context must be JSON")?,
                None => serde_json::Value::Null,
            };
            let outcome = app
                .orchestrator
                .run(OrchestrationRequest {
                    session_id: session,
                    user_id: user,
                    query,
                    context,
                })
                .await?;
            print_json(&outcome)?;
        }
        Commands::Submit {
            content,
            session,
            conversation,
            agent,
            intent,
            priority,
        } => {
            let mut new = NewTask::new(session, conversation, TaskPayload::new(intent, content));
            if let Some(agent) = agent {
                new = new.with_agent_role(agent);
            }
            if let Some(priority) = priority {
                new = new.with_priority(priority);
            }
            let tasks = app.orchestrator.tasks();
            let task = tasks.create_task(new).await?;
            tasks.dispatch(&task).await?;
            print_json(&task)?;
        }
        Commands::Task { action } => {
            let tasks = app.orchestrator.tasks();
            match action {
                TaskAction::Show { id } => match tasks.get_task(id).await? {
                    Some(task) => print_json(&task)?,
                    None => anyhow::bail!("task {id} not found"),
                },
                TaskAction::List { session } => {
                    print_json(&tasks.get_session_tasks(&session, None).await?)?;
                }
                TaskAction::Cancel { id } => match tasks.cancel_task(id).await? {
                    Some(task) => print_json(&task)?,
                    None => anyhow::bail!("task {id} not found"),
                },
            }
        }
        Commands::Escalations => {
            print_json(&app.orchestrator.escalations().list_pending().await?)?;
        }
        Commands::Approve { id, reviewer, notes } => {
            print_json(&app.orchestrator.escalations().approve(id, reviewer, notes).await?)?;
        }
        Commands::Reject { id, reviewer, notes } => {
            print_json(&app.orchestrator.escalations().reject(id, reviewer, notes).await?)?;
        }
        Commands::Resume { id } => {
            print_json(&app.orchestrator.resume_escalation(id).await?)?;
        }
        Commands::Ledger { agent: Some(agent) } => {
            print_json(&app.orchestrator.ledger().entry(&agent).await?)?;
        }
        Commands::Ledger { agent: None } => {
            let entries = app.orchestrator.ledger().entries().await?;
            if entries.is_empty() {
                println!("No ledger accounts yet.");
            } else {
                println!(
                    "{:<16} {:>10} {:>10} {:>10} {:>10}",
                    "agent", "initial", "spent", "reserved", "available"
                );
                for entry in &entries {
                    println!(
                        "{:<16} {:>10.2} {:>10.2} {:>10.2} {:>10.2}",
                        entry.agent_id,
                        entry.initial,
                        entry.spent,
                        entry.reserved,
                        entry.available()
                    );
                }
            }
        }
        Commands::DeadLetters { action } => {
            let handler = &app.dead_letters;
            match action {
                DeadLetterAction::List { limit } => print_json(&handler.list_pending(limit).await?)?,
                DeadLetterAction::Alerts => print_json(&handler.alerts().await?)?,
                DeadLetterAction::Analyze { id, notes } => {
                    print_json(&handler.analyze(id, notes).await?)?;
                }
                DeadLetterAction::Reprocess { id } => print_json(&handler.reprocess(id).await?)?,
                DeadLetterAction::Discard { id } => print_json(&handler.discard(id).await?)?,
            }
        }
        Commands::Serve => app.serve().await?,
    }

    Ok(())
}
