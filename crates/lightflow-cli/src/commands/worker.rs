//! `lightflow worker` commands

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Subcommand;

use lightflow::prelude::*;
use lightflow::signal::{Signal, SignalKind, CONTROL_CHANNEL};

use crate::context;

#[derive(Subcommand)]
pub enum WorkerCommand {
    /// Run a worker until interrupted
    Start {
        /// Comma-separated queue subset (default: config queues_default)
        #[arg(long, short)]
        queues: Option<String>,
    },

    /// Broadcast a drain request to workers on the control channel
    Stop,

    /// Query workers on the control channel
    Status,
}

pub async fn run(command: WorkerCommand, config_path: &Path) -> anyhow::Result<()> {
    let ctx = context::build(config_path)?;

    match command {
        WorkerCommand::Start { queues } => {
            let queues = match queues {
                Some(list) => list
                    .split(',')
                    .map(|q| q.parse().map_err(anyhow::Error::msg))
                    .collect::<anyhow::Result<Vec<QueueName>>>()
                    .context("parsing --queues")?,
                None => ctx.config.worker.queues_default.clone(),
            };

            let config = WorkerConfig::new(queues.clone())
                .with_concurrency(ctx.config.worker.concurrency);
            let worker = Worker::new(Arc::clone(&ctx.engine), config);
            worker.start().await?;
            println!(
                "worker {} serving {:?}; ctrl-c to stop",
                worker.worker_id(),
                queues
            );

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            println!("draining...");
            worker.shutdown().await?;
        }

        WorkerCommand::Stop => {
            ctx.engine.bus.open(CONTROL_CHANNEL).await?;
            ctx.engine
                .bus
                .publish(Signal::stop(CONTROL_CHANNEL, SignalScope::Workflow))
                .await?;
            println!("stop broadcast on the worker control channel");
        }

        WorkerCommand::Status => {
            let reply = ctx
                .engine
                .bus
                .request(
                    Signal::query(CONTROL_CHANNEL, QueryTarget::Workers),
                    Duration::from_secs(1),
                )
                .await
                .context("no worker replied on the control channel")?;

            if let SignalKind::QueryReply { body } = reply.kind {
                println!("{}", serde_json::to_string_pretty(&body)?);
            }
        }
    }
    Ok(())
}
