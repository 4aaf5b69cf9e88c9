//! Best-effort lifecycle notifications.

use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;

use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Completed,
    AwaitingApproval,
    Failed,
    Interrupted,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub event: LifecycleEvent,
    pub workspace: String,
    pub task_id: String,
    pub status: String,
    pub message: String,
}

/// Notifications never fail the caller and never block it.
pub trait Notifier {
    fn notify(&self, notification: &Notification);
}

/// Runs the configured hook command with the notification as JSON on stdin.
#[derive(Debug, Clone, Default)]
pub struct CommandNotifier {
    command: Vec<String>,
}

impl CommandNotifier {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, notification: &Notification) {
        let Some((program, args)) = self.command.split_first() else {
            debug!(event = ?notification.event, "no notify command configured");
            return;
        };
        let payload = match serde_json::to_vec(notification) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(err = %err, "failed to serialize notification");
                return;
            }
        };
        let spawned = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(mut child) => {
                if let Some(mut stdin) = child.stdin.take()
                    && let Err(err) = stdin.write_all(&payload)
                {
                    warn!(err = %err, "failed to write notification payload");
                }
                debug!(event = ?notification.event, pid = child.id(), "notification sent");
                // Reap in the background so the caller never waits on the hook.
                thread::spawn(move || child.wait());
            }
            Err(err) => warn!(program = %program, err = %err, "failed to spawn notify command"),
        }
    }
}
