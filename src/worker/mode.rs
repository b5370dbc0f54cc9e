//! Worker mode: workers listen while the controller drives the pipeline.
//!
//! Inside worker mode only the controller runs user code. Every call it makes
//! through [`Pipeline::make_call`] is broadcast on the control channel first,
//! so every rank executes the same command and meets the same collectives.
//!
//! Epistemic foundation:
//! - K_i: Control messages arrive in issue order on their own channel
//! - K_i: Worker mode nests; the frame stack records whether this rank listens
//!   or mirrors a call
//! - B_i: A command may fail on a worker → logged, the worker keeps listening
//! - B_i: The controller's body may fail → workers are told to abort

use super::comm::Channel;
use super::registry::{Command, CommandRegistry};
use crate::models::{HistMatchError, Result};
use crate::pipeline::Pipeline;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

/// What this rank is doing at one level of worker-mode nesting.
#[derive(Debug, Clone)]
pub enum Frame {
    /// In worker mode: the controller runs the body, workers listen.
    /// Holds the registry snapshot taken at entry.
    Listening { registry: CommandRegistry },
    /// Every rank is executing the same call
    Mirrored,
}

/// Control message from the controller to listening workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Call {
        op: String,
        args: Value,
        /// The controller does not execute this call
        workers_only: bool,
    },
    Exit,
    Abort {
        reason: String,
    },
}

impl Pipeline {
    /// Run `body` on the controller while workers serve its calls.
    ///
    /// Collective. The controller gets `Some(body result)`. Workers get
    /// `None` once the controller leaves, or `WorkerModeAborted` when its
    /// body failed.
    pub fn worker_mode<T, F>(&mut self, body: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut Pipeline) -> Result<T>,
    {
        if self.is_listening() {
            return body(self).map(Some);
        }

        self.frames.push(Frame::Listening {
            registry: self.registry.clone(),
        });
        let result = if self.is_controller() {
            debug!("Entering worker mode");
            let result = body(self);
            let message = match &result {
                Ok(_) => WorkerMessage::Exit,
                Err(e) => WorkerMessage::Abort { reason: e.to_string() },
            };
            match (self.send_control(&message), result) {
                (_, Err(e)) => Err(e),
                (Err(e), Ok(_)) => Err(e),
                (Ok(()), Ok(v)) => Ok(Some(v)),
            }
        } else {
            self.listen().map(|()| None)
        };
        self.frames.pop();
        result
    }

    /// Execute `op` on every rank. The controller returns its own result.
    ///
    /// Outside worker mode the call only runs locally, so every rank must
    /// reach it.
    pub fn make_call(&mut self, op: &str, args: Value) -> Result<Value> {
        let command = self.active_registry().get(op)?;
        if !(self.is_controller() && self.is_listening()) {
            return command(self, &args);
        }
        self.send_control(&WorkerMessage::Call {
            op: op.to_string(),
            args: args.clone(),
            workers_only: false,
        })?;
        self.run_mirrored(&command, &args)
    }

    /// Execute `op` on the workers only. The controller returns `Null`.
    pub fn make_call_workers(&mut self, op: &str, args: Value) -> Result<Value> {
        let command = self.active_registry().get(op)?;
        if !self.is_controller() {
            return command(self, &args);
        }
        if self.is_listening() {
            self.send_control(&WorkerMessage::Call {
                op: op.to_string(),
                args,
                workers_only: true,
            })?;
        }
        Ok(Value::Null)
    }

    /// Add a command; worker mode entered later will serve it.
    pub fn register_command<F>(&mut self, op: &str, command: F)
    where
        F: Fn(&mut Pipeline, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.registry.register(op, command);
    }

    pub fn in_worker_mode(&self) -> bool {
        self.frames.iter().any(|f| matches!(f, Frame::Listening { .. }))
    }

    fn is_listening(&self) -> bool {
        matches!(self.frames.last(), Some(Frame::Listening { .. }))
    }

    /// Registry of the innermost worker mode, else the live one.
    fn active_registry(&self) -> CommandRegistry {
        self.frames
            .iter()
            .rev()
            .find_map(|f| match f {
                Frame::Listening { registry } => Some(registry.clone()),
                Frame::Mirrored => None,
            })
            .unwrap_or_else(|| self.registry.clone())
    }

    fn run_mirrored(&mut self, command: &Command, args: &Value) -> Result<Value> {
        self.frames.push(Frame::Mirrored);
        let result = command(self, args);
        self.frames.pop();
        result
    }

    fn send_control(&self, message: &WorkerMessage) -> Result<()> {
        let value = serde_json::to_value(message)?;
        self.comm.bcast(Channel::Control, value)?;
        Ok(())
    }

    fn listen(&mut self) -> Result<()> {
        info!(rank = self.rank(), "Worker listening");
        loop {
            let value = self.comm.bcast(Channel::Control, Value::Null)?;
            match serde_json::from_value::<WorkerMessage>(value)? {
                WorkerMessage::Call { op, args, .. } => {
                    let result = self
                        .active_registry()
                        .get(&op)
                        .and_then(|command| self.run_mirrored(&command, &args));
                    if let Err(e) = result {
                        warn!(rank = self.rank(), op = %op, error = %e, "Worker call failed");
                    }
                }
                WorkerMessage::Exit => {
                    debug!(rank = self.rank(), "Worker mode exited");
                    return Ok(());
                }
                WorkerMessage::Abort { reason } => {
                    warn!(rank = self.rank(), reason = %reason, "Worker mode aborted");
                    return Err(HistMatchError::WorkerModeAborted(reason));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_worker_message_wire_format() {
        let call = WorkerMessage::Call {
            op: "emul_i".to_string(),
            args: json!({}),
            workers_only: false,
        };
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["type"], json!("call"));
        assert_eq!(serde_json::from_value::<WorkerMessage>(value).unwrap(), call);
        assert_eq!(serde_json::to_value(WorkerMessage::Exit).unwrap(), json!({"type": "exit"}));
    }
}
