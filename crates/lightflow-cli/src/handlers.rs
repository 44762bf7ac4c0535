//! Built-in script handlers available to workflow files
//!
//! Embedded deployments register their own handlers; these cover the
//! bundled example workflows.

use lightflow::prelude::*;

/// Register the handlers the example workflows reference
pub fn register_builtins(bodies: &BodyRegistry) {
    // Print the input view and forward the envelope unchanged
    bodies.register("echo", |ctx: TaskContext| async move {
        for (name, value) in ctx.data.iter() {
            println!("[{}/{}] {name} = {value}", ctx.dag, ctx.task);
        }
        Ok(TaskOutcome::success(ctx.input.clone()))
    });

    // Emit the run's launch parameters as a `params` slot
    bodies.register("emit_params", |ctx: TaskContext| async move {
        let params = ctx
            .store
            .get(&Section::Meta, "params")
            .await?
            .unwrap_or(serde_json::Value::Null);
        let output = Envelope::from_slots([("params".to_string(), params)])?;
        Ok(TaskOutcome::success(output))
    });

    // Launch the non-autostart DAG named by the `dag` launch parameter
    bodies.register("launch_dag", |ctx: TaskContext| async move {
        let params = ctx
            .store
            .get(&Section::Meta, "params")
            .await?
            .unwrap_or(serde_json::Value::Null);
        let dag = params["dag"]
            .as_str()
            .ok_or_else(|| TaskError::fatal("params", "launch_dag needs a `dag` parameter"))?
            .to_string();
        println!("[{}/{}] launching dag {dag}", ctx.dag, ctx.task);
        ctx.signals.run_dag(dag, None).await?;
        Ok(TaskOutcome::empty())
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let bodies = BodyRegistry::new();
        register_builtins(&bodies);
        assert!(bodies.get("echo").is_some());
        assert!(bodies.get("emit_params").is_some());
        assert!(bodies.get("launch_dag").is_some());
    }
}
