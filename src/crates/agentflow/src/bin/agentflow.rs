//! The agentflow CLI.
//!
//! Exit codes: 0 success, 1 runtime error (including workflow failure),
//! 2 configuration error, 3 usage error.

use agentflow::{exit_codes, RunOptions, RunReport, RunStatus, Runner, RunnerError, TracingSink};
use agentflow_core::{StorageConfig, WorkflowConfig};
use agentflow_storage::Storage;
use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agentflow", version, about = "Run declarative LLM workflows")]
struct Cli {
    /// Verbose (debug-level) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a workflow to completion
    Run {
        /// Workflow config file (YAML or JSON)
        config: PathBuf,

        /// Run inputs as key=value pairs (values parsed as JSON, falling
        /// back to plain strings)
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,

        /// SQLite database path (defaults to the config's storage block,
        /// then agentflow.db)
        #[arg(long)]
        storage_path: Option<PathBuf>,

        /// Keep execution records in memory only
        #[arg(long, conflicts_with = "storage_path")]
        no_persist: bool,
    },

    /// Load and validate a workflow config without executing it
    Validate {
        config: PathBuf,
    },

    /// Print the compiled graph as a Mermaid flowchart
    Inspect {
        config: PathBuf,
    },

    /// List recent executions of a workflow
    Executions {
        /// Workflow name
        workflow: String,

        #[arg(long, default_value_t = 20)]
        limit: u32,

        #[arg(long)]
        storage_path: Option<PathBuf>,
    },
}

fn parse_inputs(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut inputs = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("input '{pair}' is not KEY=VALUE"))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        inputs.insert(key.to_string(), value);
    }
    Ok(inputs)
}

async fn open_storage(
    config: &WorkflowConfig,
    storage_path: Option<PathBuf>,
    no_persist: bool,
) -> anyhow::Result<Storage> {
    if no_persist {
        return Ok(Storage::in_memory());
    }
    if let Some(path) = storage_path {
        let storage_config = StorageConfig {
            backend: "sqlite".to_string(),
            url: None,
            path: Some(path.display().to_string()),
        };
        return Ok(Storage::open(&storage_config).await?);
    }
    match &config.config.storage {
        Some(storage_config) => Ok(Storage::open(storage_config).await?),
        None => {
            let storage_config = StorageConfig {
                backend: "sqlite".to_string(),
                url: None,
                path: Some("agentflow.db".to_string()),
            };
            Ok(Storage::open(&storage_config).await?)
        }
    }
}

fn runner_exit_code(error: &RunnerError) -> i32 {
    match error {
        RunnerError::Load(_) | RunnerError::Validation(_) | RunnerError::Build(_) => {
            exit_codes::CONFIG_ERROR
        }
        _ => exit_codes::RUNTIME_ERROR,
    }
}

fn print_report(report: &RunReport) {
    match report.status {
        RunStatus::Succeeded => println!("status: succeeded"),
        RunStatus::Failed => println!("status: failed"),
        RunStatus::Cancelled => println!("status: cancelled"),
    }
    println!("execution: {}", report.execution_id);
    println!(
        "tokens: {} in / {} out, cost: ${:.6}",
        report.totals.input_tokens, report.totals.output_tokens, report.totals.cost
    );
    if let Some(error) = &report.error {
        println!("error: {error}");
    }
    if let Some(state) = &report.final_state {
        println!(
            "{}",
            serde_json::to_string_pretty(state).unwrap_or_else(|_| state.to_string())
        );
    }
}

async fn execute(cli: Cli) -> i32 {
    match cli.command {
        Command::Run {
            config,
            inputs,
            storage_path,
            no_persist,
        } => {
            let inputs = match parse_inputs(&inputs) {
                Ok(inputs) => inputs,
                Err(error) => {
                    eprintln!("error: {error:#}");
                    return exit_codes::USAGE_ERROR;
                }
            };
            let config = match WorkflowConfig::from_file(&config) {
                Ok(config) => config,
                Err(error) => {
                    eprintln!("error: {error}");
                    return exit_codes::CONFIG_ERROR;
                }
            };
            let storage = match open_storage(&config, storage_path, no_persist).await {
                Ok(storage) => storage,
                Err(error) => {
                    eprintln!("error: {error:#}");
                    return exit_codes::RUNTIME_ERROR;
                }
            };

            let runner = Runner::new(storage, Arc::new(TracingSink::new()));
            match runner.run(&config, inputs, RunOptions::default()).await {
                Ok(report) => {
                    print_report(&report);
                    if report.is_success() {
                        exit_codes::SUCCESS
                    } else {
                        exit_codes::RUNTIME_ERROR
                    }
                }
                Err(error) => {
                    eprintln!("error: {error}");
                    runner_exit_code(&error)
                }
            }
        }

        Command::Validate { config } => {
            let config = match WorkflowConfig::from_file(&config) {
                Ok(config) => config,
                Err(error) => {
                    eprintln!("error: {error}");
                    return exit_codes::CONFIG_ERROR;
                }
            };
            let runner = Runner::new(Storage::in_memory(), Arc::new(agentflow::NoopTracer));
            match runner.compile(&config) {
                Ok(_workflow) => {
                    println!("{} is valid", config.flow.name);
                    exit_codes::SUCCESS
                }
                Err(error) => {
                    eprintln!("{error}");
                    runner_exit_code(&error)
                }
            }
        }

        Command::Inspect { config } => {
            let config = match WorkflowConfig::from_file(&config) {
                Ok(config) => config,
                Err(error) => {
                    eprintln!("error: {error}");
                    return exit_codes::CONFIG_ERROR;
                }
            };
            let runner = Runner::new(Storage::in_memory(), Arc::new(agentflow::NoopTracer));
            match runner.compile(&config) {
                Ok(workflow) => {
                    println!("{}", workflow.to_mermaid());
                    exit_codes::SUCCESS
                }
                Err(error) => {
                    eprintln!("{error}");
                    runner_exit_code(&error)
                }
            }
        }

        Command::Executions {
            workflow,
            limit,
            storage_path,
        } => {
            let storage_config = StorageConfig {
                backend: "sqlite".to_string(),
                url: None,
                path: Some(
                    storage_path
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "agentflow.db".to_string()),
                ),
            };
            let storage = match Storage::open(&storage_config).await {
                Ok(storage) => storage,
                Err(error) => {
                    eprintln!("error: {error}");
                    return exit_codes::RUNTIME_ERROR;
                }
            };
            match storage
                .executions
                .list_by_workflow(&workflow, limit, None)
                .await
            {
                Ok(executions) => {
                    for execution in executions {
                        println!(
                            "{}  {}  started={}  tokens={}  cost=${:.6}{}",
                            execution.id,
                            execution.status,
                            execution.started_at,
                            execution.totals.total_tokens(),
                            execution.totals.cost,
                            execution
                                .error
                                .map(|e| format!("  error={e}"))
                                .unwrap_or_default()
                        );
                    }
                    exit_codes::SUCCESS
                }
                Err(error) => {
                    eprintln!("error: {error}");
                    exit_codes::RUNTIME_ERROR
                }
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            // Help and version print normally; bad arguments are usage
            // errors with their own exit code.
            use clap::error::ErrorKind;
            if matches!(
                error.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            ) {
                let _ = error.print();
                std::process::exit(exit_codes::SUCCESS);
            }
            let _ = error.print();
            std::process::exit(exit_codes::USAGE_ERROR);
        }
    };

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    std::process::exit(execute(cli).await);
}
