//! Embedded engine assembly: config -> library -> engine

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

use lightflow::prelude::*;

use crate::handlers;

/// Everything a command needs to talk to the engine
pub struct CliContext {
    pub config: Config,
    pub engine: Arc<Engine>,
}

/// Load config, discover workflows and wire the in-process engine
pub fn build(config_path: &Path) -> anyhow::Result<CliContext> {
    let config = Config::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    init_tracing(&config);

    let library = WorkflowLibrary::discover(&config.workflows)
        .context("discovering workflow definitions")?;

    let bodies = BodyRegistry::new();
    handlers::register_builtins(&bodies);

    let engine = Engine::in_memory(library, bodies);
    Ok(CliContext { config, engine })
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    // A second init in one process (tests) is fine to ignore
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
