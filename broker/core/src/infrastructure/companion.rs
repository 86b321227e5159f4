// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Companion Process Runtime
//
// One child process per agent, started from a configured argv template.
// Arguments are substituted element by element and handed straight to
// exec; nothing is ever interpreted by a shell.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::agent::AgentId;
use crate::domain::broker_config::CompanionConfig;
use crate::domain::companion::{CompanionHandle, CompanionRuntime, CompanionSpec, RuntimeError};

/// Substitutes `{id}`, `{input}`, `{output}` and `{channel}` in every argument.
pub fn render_args(template: &[String], spec: &CompanionSpec) -> Vec<String> {
    let id = spec.agent_id.to_string();
    let input = spec.input.display().to_string();
    let output = spec.output.display().to_string();

    template
        .iter()
        .map(|arg| {
            arg.replace("{id}", &id)
                .replace("{input}", &input)
                .replace("{output}", &output)
                .replace("{channel}", &spec.channel_name)
        })
        .collect()
}

pub struct ProcessCompanionRuntime {
    program: String,
    args: Vec<String>,
    spawn_delay: Duration,
    shutdown_grace: Duration,
}

impl ProcessCompanionRuntime {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        spawn_delay: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            spawn_delay,
            shutdown_grace,
        }
    }

    pub fn from_config(config: &CompanionConfig) -> Self {
        Self::new(
            config.program.clone(),
            config.args.clone(),
            config.spawn_delay(),
            config.shutdown_grace(),
        )
    }

    fn command(&self, spec: &CompanionSpec) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(render_args(&self.args, spec))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

impl CompanionRuntime for ProcessCompanionRuntime {
    fn launch(&self, spec: CompanionSpec) -> Result<Option<CompanionHandle>, RuntimeError> {
        if self.program.trim().is_empty() {
            return Err(RuntimeError::InvalidCommand(
                "companion program is empty".to_string(),
            ));
        }

        let agent_id = spec.agent_id;
        let command = self.command(&spec);
        let stop = CancellationToken::new();
        let task = tokio::spawn(supervise(
            agent_id,
            self.program.clone(),
            command,
            self.spawn_delay,
            self.shutdown_grace,
            stop.clone(),
        ));

        Ok(Some(CompanionHandle::new(agent_id, task, stop)))
    }
}

/// Runtime for brokers whose agents are driven from outside.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledCompanionRuntime;

impl CompanionRuntime for DisabledCompanionRuntime {
    fn launch(&self, _spec: CompanionSpec) -> Result<Option<CompanionHandle>, RuntimeError> {
        Ok(None)
    }
}

async fn supervise(
    agent_id: AgentId,
    program: String,
    mut command: Command,
    spawn_delay: Duration,
    shutdown_grace: Duration,
    stop: CancellationToken,
) {
    tokio::select! {
        _ = stop.cancelled() => {
            debug!(agent_id = %agent_id, "Companion cancelled before spawn");
            return;
        }
        _ = tokio::time::sleep(spawn_delay) => {}
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let err = RuntimeError::SpawnFailed(format!("{program}: {e}"));
            error!(agent_id = %agent_id, error = %err, "Companion did not start");
            return;
        }
    };
    info!(agent_id = %agent_id, pid = ?child.id(), program = %program, "Companion started");

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(agent_id = %agent_id, "companion: {}", line);
            }
        });
    }

    let stopping = tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) if status.success() => info!(agent_id = %agent_id, "Companion exited"),
                Ok(status) => warn!(agent_id = %agent_id, %status, "Companion exited with failure"),
                Err(e) => warn!(agent_id = %agent_id, error = %e, "Failed to wait on companion"),
            }
            false
        }
        _ = stop.cancelled() => true,
    };

    if stopping {
        terminate(agent_id, &mut child, shutdown_grace).await;
    }
}

/// Asks the child to stop, then kills it once the grace period runs out.
async fn terminate(agent_id: AgentId, child: &mut Child, grace: Duration) {
    request_stop(agent_id, child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(agent_id = %agent_id, %status, "Companion stopped"),
        Ok(Err(e)) => warn!(agent_id = %agent_id, error = %e, "Failed to wait on companion"),
        Err(_) => {
            warn!(
                agent_id = %agent_id,
                grace_ms = grace.as_millis() as u64,
                "Companion ignored shutdown request; killing"
            );
            if let Err(e) = child.kill().await {
                warn!(agent_id = %agent_id, error = %e, "Failed to kill companion");
            }
        }
    }
}

#[cfg(unix)]
fn request_stop(agent_id: AgentId, child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(agent_id = %agent_id, error = %e, "SIGTERM not delivered to companion");
    }
}

#[cfg(not(unix))]
fn request_stop(_agent_id: AgentId, _child: &Child) {}
