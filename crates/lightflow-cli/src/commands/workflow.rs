//! `lightflow workflow` commands

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Subcommand;
use uuid::Uuid;

use lightflow::prelude::*;
use lightflow::signal::SignalKind;

use crate::context;

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// List workflows found in the configured search paths
    List,

    /// Start a workflow run
    Start {
        /// Workflow name
        name: String,

        /// Launch parameters, key=value (value parsed as JSON when possible)
        #[arg(long = "param", short = 'p', value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Exit right after submission instead of following the run
        #[arg(long)]
        no_wait: bool,
    },

    /// Request a co-operative stop of a run
    Stop {
        /// Run id
        run_id: Uuid,
    },

    /// Abort a run without draining
    Abort {
        /// Run id
        run_id: Uuid,
    },

    /// Query the status of a run
    Status {
        /// Run id
        run_id: Option<Uuid>,
    },
}

pub async fn run(command: WorkflowCommand, config_path: &Path) -> anyhow::Result<()> {
    let ctx = context::build(config_path)?;

    match command {
        WorkflowCommand::List => {
            let defs = ctx.engine.library.list();
            if defs.is_empty() {
                println!("no workflows found in {:?}", ctx.config.workflows);
                return Ok(());
            }
            for def in defs {
                let description = def.description.lines().next().unwrap_or("");
                println!("{:<24} {}", def.name, description);
            }
        }

        WorkflowCommand::Start {
            name,
            params,
            no_wait,
        } => {
            let params = parse_params(&params)?;
            let run_id = submit_workflow(&ctx.engine, &name, params).await?;
            println!("run {run_id} submitted");

            if no_wait {
                return Ok(());
            }

            // Embedded deployment: follow the run with in-process workers
            let mut stream = ctx.engine.bus.subscribe(run_id).await;
            let worker = Worker::new(
                Arc::clone(&ctx.engine),
                WorkerConfig::default().with_concurrency(ctx.config.worker.concurrency),
            );
            worker.start().await?;

            let state = loop {
                tokio::select! {
                    signal = stream.recv() => match signal {
                        Some(signal) => {
                            if let SignalKind::WorkflowCompleted { state, first_failure } = signal.kind {
                                if let Some(failure) = first_failure {
                                    eprintln!(
                                        "first failure: dag={} task={} kind={}",
                                        failure.dag, failure.task, failure.kind
                                    );
                                }
                                break Some(state);
                            }
                        }
                        None => break None,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("interrupt: requesting stop of run {run_id}");
                        stop_run(&ctx.engine, run_id).await?;
                    }
                }
            };

            worker.shutdown().await?;
            match state {
                Some(state) => {
                    println!("run {run_id} {state}");
                    if !matches!(state, RunState::Succeeded | RunState::Stopped) {
                        anyhow::bail!("run finished in state {state}");
                    }
                }
                None => println!("run {run_id} channel closed"),
            }
        }

        WorkflowCommand::Stop { run_id } => {
            stop_run(&ctx.engine, run_id).await?;
            println!("stop requested for run {run_id}");
        }

        WorkflowCommand::Abort { run_id } => {
            abort_run(&ctx.engine, run_id).await?;
            println!("abort requested for run {run_id}");
        }

        WorkflowCommand::Status { run_id } => {
            let Some(run_id) = run_id else {
                println!("no run id given; pass the id printed by `workflow start`");
                return Ok(());
            };
            let status = run_status(&ctx.engine, run_id, Duration::from_secs(2)).await?;
            let state = status
                .state
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            println!("run:      {run_id}");
            if let Some(workflow) = status.workflow {
                println!("workflow: {workflow}");
            }
            println!("state:    {state}");
            if !status.live_dags.is_empty() {
                println!("live:     {}", status.live_dags.join(", "));
            }
        }
    }
    Ok(())
}

/// Parse repeated `key=value` flags into a JSON object
///
/// Values that parse as JSON keep their type; everything else is a string.
fn parse_params(params: &[String]) -> anyhow::Result<serde_json::Value> {
    let mut map = serde_json::Map::new();
    for param in params {
        let (key, value) = param
            .split_once('=')
            .with_context(|| format!("invalid --param {param:?}, expected key=value"))?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(serde_json::Value::Object(map))
}
