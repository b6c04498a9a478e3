use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conductor_bus::MessageBroker;
use conductor_core::AgentRegistry;
use conductor_workflow::{Orchestrator, WorkflowEvent, WorkflowResult};

mod config;
mod loopback;

use config::ConductorConfig;
use loopback::LoopbackAgent;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version)]
#[command(about = "Run multi-agent workflows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config directory and default config
    Init,

    /// Show current configuration
    Config,

    /// List configured agents
    Agents,

    /// List configured workflows
    Workflows,

    /// Execute a workflow against the configured agents
    Run {
        /// Workflow id
        workflow: String,

        /// Initial variable, as KEY=VALUE (VALUE is parsed as JSON when possible)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Agents => cmd_agents(&cli.config).await,
        Commands::Workflows => cmd_workflows(&cli.config).await,
        Commands::Run { workflow, vars } => cmd_run(&cli.config, &workflow, &vars).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        info!("Created default config at {}", config_path.display());
    }

    println!("Conductor initialized at {}", config_dir.display());
    println!(
        "Edit {} to declare agents and workflows.",
        config_path.display()
    );
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ConductorConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg)?);
    Ok(())
}

async fn cmd_agents(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ConductorConfig::load(config_path)?;
    if cfg.agents.is_empty() {
        println!("No agents configured.");
        return Ok(());
    }

    println!("{:<16} {:<12} {:<8} CAPABILITIES", "ID", "TYPE", "ENABLED");
    for entry in &cfg.agents {
        let agent = &entry.descriptor;
        let capabilities: Vec<&str> = agent.capabilities.iter().map(|c| c.id.as_str()).collect();
        println!(
            "{:<16} {:<12} {:<8} {}",
            agent.id,
            agent.agent_type,
            agent.enabled,
            capabilities.join(", ")
        );
    }
    Ok(())
}

async fn cmd_workflows(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ConductorConfig::load(config_path)?;
    if cfg.workflows.is_empty() {
        println!("No workflows configured.");
        return Ok(());
    }

    for workflow in &cfg.workflows {
        println!(
            "{} ({} steps, on error: {})",
            workflow.id,
            workflow.steps.len(),
            workflow.error_policy
        );
        if !workflow.description.is_empty() {
            println!("  {}", workflow.description);
        }
        for step in &workflow.steps {
            println!(
                "  - {:<14} {}.{} (retries: {})",
                step.id, step.agent, step.capability, step.retries
            );
        }
    }
    Ok(())
}

async fn cmd_run(config_path: &Option<PathBuf>, workflow_id: &str, raw_vars: &[String]) -> Result<()> {
    let cfg = ConductorConfig::load(config_path)?;
    let variables = parse_vars(raw_vars)?;

    let broker = MessageBroker::new(Arc::new(AgentRegistry::new()));
    for entry in &cfg.agents {
        broker
            .mount(Arc::new(LoopbackAgent::from_entry(entry)))
            .await
            .with_context(|| format!("Failed to mount agent '{}'", entry.descriptor.id))?;
    }

    let orchestrator = Orchestrator::with_config(broker, cfg.orchestrator.to_config());
    for entry in &cfg.workflows {
        let workflow = entry.to_workflow(cfg.orchestrator.default_step_timeout());
        orchestrator
            .register_workflow(workflow)
            .await
            .with_context(|| format!("Failed to register workflow '{}'", entry.id))?;
    }

    let mut events = orchestrator.subscribe_workflow(workflow_id);
    let event_logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    log_event(&event);
                    if event.is_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Event log skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let orchestrator = Arc::new(orchestrator);
    let interrupt = tokio::spawn({
        let orchestrator = orchestrator.clone();
        let workflow_id = workflow_id.to_string();
        async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling workflow '{}'", workflow_id);
                orchestrator.cancel_workflow(&workflow_id);
            }
        }
    });

    let result = orchestrator
        .execute_workflow(workflow_id, variables)
        .await
        .with_context(|| format!("Failed to run workflow '{}'", workflow_id));

    interrupt.abort();
    let _ = interrupt.await;
    // Last handle gone closes the event channel
    drop(orchestrator);
    let _ = event_logger.await;

    let result = result?;
    print_result(&result)?;
    if !result.is_success() {
        anyhow::bail!(
            "workflow '{}' finished with status {}",
            result.workflow_id,
            result.status
        );
    }
    Ok(())
}

fn log_event(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::Started { workflow_id, execution_id, .. } => {
            info!("[{}] started (execution {})", workflow_id, execution_id)
        }
        WorkflowEvent::StepFinished {
            workflow_id,
            step_id,
            outcome,
            attempts,
            ..
        } => info!(
            "[{}] step '{}' {} after {} attempts",
            workflow_id, step_id, outcome, attempts
        ),
        WorkflowEvent::Finished {
            workflow_id,
            status,
            duration,
            ..
        } => info!("[{}] {} in {:?}", workflow_id, status, duration),
    }
}

fn print_result(result: &WorkflowResult) -> Result<()> {
    println!(
        "\n{:<16} {:<8} {:>8} {:>10}  ERROR",
        "STEP", "OUTCOME", "ATTEMPTS", "DURATION"
    );
    for step in &result.steps {
        println!(
            "{:<16} {:<8} {:>8} {:>8}ms  {}",
            step.step_id,
            step.outcome,
            step.attempts,
            step.duration.as_millis(),
            step.error.as_ref().map(|e| e.to_string()).unwrap_or_default()
        );
    }
    for record in &result.compensations {
        println!(
            "compensated '{}' via {}.{}: {}",
            record.step_id,
            record.agent_id,
            record.capability_id,
            match &record.error {
                Some(e) => e.to_string(),
                None => "ok".to_string(),
            }
        );
    }

    println!("\nStatus: {}", result.status);
    if let Some(error) = &result.error {
        println!("Error: {}", error);
    }
    if let Some(output) = &result.output {
        println!("Output:\n{}", serde_json::to_string_pretty(output)?);
    }
    Ok(())
}

/// Parse `KEY=VALUE` pairs. Values that are not valid JSON become strings.
fn parse_vars(raw: &[String]) -> Result<HashMap<String, Value>> {
    raw.iter().map(|pair| parse_var(pair)).collect()
}

fn parse_var(pair: &str) -> Result<(String, Value)> {
    let (key, value) = pair
        .split_once('=')
        .with_context(|| format!("Invalid --var '{}': expected KEY=VALUE", pair))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("Invalid --var '{}': empty key", pair);
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
