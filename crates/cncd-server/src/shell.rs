//! Shell task runner
//!
//! Spawns the system commands configured as event reactions and reports
//! their lifecycle as `task:start`, `task:finish` and `task:error` events
//! fanned out to every session.

use cncd_communication::ShellSpawner;
use cncd_core::ServerEvent;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Spawns shell commands and reports task lifecycle events
pub struct ShellRunner {
    events: UnboundedSender<ServerEvent>,
}

impl ShellRunner {
    /// Create a runner publishing on the engine's event channel
    pub fn new(events: UnboundedSender<ServerEvent>) -> Self {
        Self { events }
    }

    /// Spawn a command line, returning its task id
    pub fn spawn_command(&self, commands: &str) -> String {
        let task_id = Uuid::new_v4().to_string();
        tracing::info!("Spawning task {}: {}", task_id, commands);

        let _ = self.events.send(ServerEvent::TaskStart {
            task_id: task_id.clone(),
        });

        let events = self.events.clone();
        let commands = commands.to_string();
        let id = task_id.clone();
        tokio::spawn(async move {
            let result = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&commands)
                .output()
                .await;

            match result {
                Ok(output) => {
                    let code = output.status.code();
                    if !output.status.success() {
                        tracing::warn!("Task {} exited with {:?}", id, code);
                    }
                    let _ = events.send(ServerEvent::TaskFinish { task_id: id, code });
                }
                Err(e) => {
                    tracing::error!("Task {} failed to spawn: {}", id, e);
                    let _ = events.send(ServerEvent::TaskError {
                        task_id: id,
                        error: e.to_string(),
                    });
                }
            }
        });

        task_id
    }
}

impl ShellSpawner for ShellRunner {
    fn spawn(&self, commands: &str) {
        self.spawn_command(commands);
    }
}
