//! Inbound control commands and their side effects on the host.

use crate::docker::{is_container_ref, ContainerAction, ContainerRuntime, RuntimeError};
use crate::metrics::Metrics;
use serde::Deserialize;
use std::sync::{Arc, Mutex, PoisonError};
use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no such process: {0}")]
    NoSuchProcess(u32),
    #[error("kill signal to process {0} was refused")]
    KillRefused(u32),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("process control task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

/// A validated command. Anything that does not decode into one of these is
/// dropped without a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    KillProcess { pid: u32 },
    Container { id: String, action: ContainerAction },
}

#[derive(Deserialize)]
struct RawCommand {
    action: String,
    #[serde(default)]
    pid: Option<i64>,
    #[serde(default)]
    container_id: Option<String>,
}

impl Command {
    pub fn decode(payload: &[u8]) -> Option<Command> {
        let raw: RawCommand = serde_json::from_slice(payload).ok()?;
        match raw.action.as_str() {
            "kill_process" => {
                let pid = raw.pid.filter(|pid| *pid > 0)?;
                let pid = u32::try_from(pid).ok()?;
                Some(Command::KillProcess { pid })
            }
            "docker_start" => Command::container(raw.container_id, ContainerAction::Start),
            "docker_stop" => Command::container(raw.container_id, ContainerAction::Stop),
            "docker_restart" => Command::container(raw.container_id, ContainerAction::Restart),
            _ => None,
        }
    }

    fn container(id: Option<String>, action: ContainerAction) -> Option<Command> {
        let id = id.filter(|id| is_container_ref(id))?;
        Some(Command::Container { id, action })
    }

    pub fn action(&self) -> &'static str {
        match self {
            Command::KillProcess { .. } => "kill_process",
            Command::Container { action, .. } => match action {
                ContainerAction::Start => "docker_start",
                ContainerAction::Stop => "docker_stop",
                ContainerAction::Restart => "docker_restart",
            },
        }
    }
}

/// OS process-termination boundary.
pub trait ProcessControl: Send + Sync {
    fn terminate(&self, pid: u32) -> Result<(), ControlError>;
}

pub struct SysinfoProcessControl {
    system: Mutex<System>,
}

impl Default for SysinfoProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProcessControl {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl ProcessControl for SysinfoProcessControl {
    fn terminate(&self, pid: u32) -> Result<(), ControlError> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let target = Pid::from_u32(pid);
        if !system.refresh_process(target) {
            return Err(ControlError::NoSuchProcess(pid));
        }
        let process = system
            .process(target)
            .ok_or(ControlError::NoSuchProcess(pid))?;
        if process.kill() {
            Ok(())
        } else {
            Err(ControlError::KillRefused(pid))
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    runtime: Arc<dyn ContainerRuntime>,
    processes: Arc<dyn ProcessControl>,
    metrics: Option<Arc<Metrics>>,
}

impl Dispatcher {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, processes: Arc<dyn ProcessControl>) -> Self {
        Self {
            runtime,
            processes,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Decodes and executes one inbound message. Malformed or unknown
    /// commands are no-ops.
    pub async fn handle(&self, payload: &[u8]) {
        let Some(command) = Command::decode(payload) else {
            debug!(len = payload.len(), "dropping malformed or unknown command");
            return;
        };
        if let Err(err) = self.dispatch(&command).await {
            info!(action = command.action(), error = %err, "command failed");
        }
    }

    pub async fn dispatch(&self, command: &Command) -> Result<(), ControlError> {
        if let Some(metrics) = &self.metrics {
            metrics.inc_command(command.action());
        }
        match command {
            Command::KillProcess { pid } => {
                let pid = *pid;
                let processes = Arc::clone(&self.processes);
                tokio::task::spawn_blocking(move || processes.terminate(pid)).await??;
                info!(pid, "process terminated");
            }
            Command::Container { id, action } => {
                self.runtime.container_action(id, *action).await?;
                info!(container = %id, action = %action, "container action applied");
            }
        }
        Ok(())
    }
}
