//! Commands that can be called by name on every rank.
//!
//! Epistemic foundation:
//! - K_i: Every rank resolves an op to the same command
//! - B_i: Callers may name unknown ops or pass malformed arguments → Input / Type error
//! - I^R: Users extend the registry with `Pipeline::register_command`

use super::comm::Channel;
use crate::models::{ExternalRealizationSet, HistMatchError, ParRef, Result};
use crate::pipeline::Pipeline;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A callable command: receives the pipeline and its JSON arguments.
pub type Command = Arc<dyn Fn(&mut Pipeline, &Value) -> Result<Value> + Send + Sync>;

/// Map from op id to command.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Command>,
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry").field("ops", &self.ops()).finish()
    }
}

impl CommandRegistry {
    /// Registry holding the pipeline operations and communicator helpers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();

        registry.register("construct", |p, args| {
            let ext = match args.get("ext") {
                None | Some(Value::Null) => None,
                Some(v) => Some(ExternalRealizationSet::from_value(v)?),
            };
            let k = p.construct(
                field(args, "emul_i")?,
                field(args, "analyze")?.unwrap_or(true),
                field(args, "force")?.unwrap_or(false),
                ext,
            )?;
            Ok(json!(k))
        });
        registry.register("analyze", |p, args| {
            p.analyze(field(args, "impl_cut")?)?;
            Ok(Value::Null)
        });
        registry.register("evaluate", |p, args| {
            let sam_set = args
                .get("sam_set")
                .ok_or_else(|| HistMatchError::Input("evaluate needs a 'sam_set' argument".to_string()))?;
            let evals = p.evaluate_value(sam_set, field(args, "emul_i")?)?;
            Ok(serde_json::to_value(evals)?)
        });
        registry.register("details", |p, args| {
            Ok(serde_json::to_value(p.details(field(args, "emul_i")?)?)?)
        });
        registry.register("project", |p, args| {
            let proj_par: Option<Vec<ParRef>> = field(args, "proj_par")?;
            let surfaces = p.project(
                field(args, "emul_i")?,
                proj_par.as_deref(),
                field(args, "force")?.unwrap_or(false),
                None,
            )?;
            Ok(serde_json::to_value(surfaces)?)
        });
        registry.register("emul_i", |p, _| Ok(json!(p.emul_i())));
        registry.register("comm.rank", |p, _| Ok(json!(p.rank())));
        registry.register("comm.size", |p, _| Ok(json!(p.comm().size())));
        registry.register("comm.gather_rank", |p, _| {
            let ranks = p.comm().gather(Channel::Data, json!(p.rank()))?;
            Ok(ranks.map_or(Value::Null, Value::Array))
        });
        registry.register("comm.barrier", |p, _| {
            p.comm().barrier()?;
            Ok(Value::Null)
        });
        registry.register("worker_mode.active", |p, _| Ok(json!(p.in_worker_mode())));
        registry.register("make_call", |p, args| {
            let (op, inner) = call_args(args)?;
            p.make_call(&op, inner)
        });
        registry.register("make_call_workers", |p, args| {
            let (op, inner) = call_args(args)?;
            p.make_call_workers(&op, inner)
        });

        registry
    }

    pub fn register<F>(&mut self, op: &str, command: F)
    where
        F: Fn(&mut Pipeline, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.commands.insert(op.to_string(), Arc::new(command));
    }

    /// B_i(op registered) → Input error
    pub fn get(&self, op: &str) -> Result<Command> {
        self.commands
            .get(op)
            .cloned()
            .ok_or_else(|| HistMatchError::Input(format!("unknown op '{op}'")))
    }

    /// Registered op ids, sorted.
    pub fn ops(&self) -> Vec<&str> {
        let mut ops: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        ops.sort_unstable();
        ops
    }
}

/// Optional named argument.
///
/// B_i(argument has the expected type) → Type error
fn field<T: DeserializeOwned>(args: &Value, key: &str) -> Result<Option<T>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|e| HistMatchError::Type(format!("argument '{key}': {e}"))),
    }
}

fn call_args(args: &Value) -> Result<(String, Value)> {
    let op: String = field(args, "op")?
        .ok_or_else(|| HistMatchError::Input("nested call needs an 'op' argument".to_string()))?;
    Ok((op, args.get("args").cloned().unwrap_or(Value::Null)))
}
