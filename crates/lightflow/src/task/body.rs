//! Task bodies: the script-handler registry and command execution

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::json;
use tokio::process::Command;
use tracing::debug;

use super::context::TaskContext;
use super::outcome::{TaskError, TaskOutcome};
use crate::data::Envelope;
use crate::spec::TaskNode;
use crate::store::Section;

/// What a body invocation returns
pub type BodyResult = Result<TaskOutcome, TaskError>;

/// Boxed async script handler
pub type ScriptHandler =
    Arc<dyn Fn(TaskContext) -> Pin<Box<dyn Future<Output = BodyResult> + Send>> + Send + Sync>;

/// Script handlers registered at worker startup, resolved by name
///
/// # Example
///
/// ```ignore
/// let mut bodies = BodyRegistry::new();
/// bodies.register("ingest", |ctx| async move {
///     let rows = fetch(&ctx.data).await?;
///     Ok(TaskOutcome::success(Envelope::from_slots([("rows".into(), rows)])?))
/// });
/// ```
#[derive(Default)]
pub struct BodyRegistry {
    handlers: RwLock<HashMap<String, ScriptHandler>>,
}

impl BodyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a name referenced by script-body tasks
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BodyResult> + Send + 'static,
    {
        let handler: ScriptHandler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.handlers.write().insert(name.into(), handler);
    }

    /// Resolve a handler by name
    pub fn get(&self, name: &str) -> Option<ScriptHandler> {
        self.handlers.read().get(name).cloned()
    }

    /// Registered handler names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Execute a command body: spawn, capture streams, classify the exit
///
/// Stdout (trailing newline trimmed) fills the first declared output slot,
/// or a `stdout` slot when none is declared. Exit status and captured
/// stderr go to the task's store section.
pub(crate) async fn run_command(
    program: &str,
    args: &[String],
    env: &HashMap<String, String>,
    node: &TaskNode,
    ctx: &TaskContext,
) -> BodyResult {
    debug!(program, ?args, "spawning command body");

    let output = Command::new(program)
        .args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| TaskError::Spawn(format!("{program}: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout)
        .trim_end_matches('\n')
        .to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let section = Section::task(&ctx.dag, &ctx.task);
    ctx.store
        .set(&section, "exit_status", json!(output.status.code()))
        .await?;
    if !stderr.is_empty() {
        ctx.store.set(&section, "stderr", json!(stderr)).await?;
    }

    if !output.status.success() {
        return Err(TaskError::recoverable(
            "command",
            format!("{program} exited with {}", output.status),
        ));
    }

    let slot = node
        .outputs
        .first()
        .map(String::as_str)
        .unwrap_or("stdout");
    let envelope = Envelope::from_slots([(slot.to_string(), json!(stdout))])?;
    Ok(TaskOutcome::success(envelope))
}
