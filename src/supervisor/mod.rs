//! Checkpoint/restore supervision of the traced child.
//!
//! The watcher process owns one [`Supervisor`]. It spawns `rewind trace`,
//! snapshots the child whenever the tracer asks, and swaps in a restored
//! process image when a rewind id lands on the `watcher` channel.

pub mod process;
mod session;

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::checkpoint::{CheckpointError, Checkpointer, CriuCheckpointer};
use crate::config::Config;
use crate::data::{Database, DatabaseError, TimelineStore};
use crate::mailbox::{Channel, Mailbox, MailboxError};
use crate::protocol::{CheckpointAck, CheckpointRequest};

pub use process::{shutdown_gracefully, ChildProcess, CommandLauncher, Launcher, SystemChild};
pub use session::{Outbound, SessionManager};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("Failed to spawn the traced child: {0}")]
    Spawn(#[source] io::Error),
    #[error("Failed to manage the traced child: {0}")]
    Child(#[source] io::Error),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SupervisorError {
    /// No active target, no pointer, or no script on disk to show
    pub fn is_not_found(&self) -> bool {
        match self {
            SupervisorError::Database(e) => e.is_not_found(),
            SupervisorError::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Process exit status of `rewind watch` for this failure
    pub fn exit_code(&self) -> i32 {
        2
    }
}

/// Where the traced child currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Spawned,
    Running,
    Snapshotting,
    Continued,
    Rewound,
    Terminated,
}

/// Result of one pass of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Running,
    Finished,
}

/// How `rewind watch` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Finished,
    NoActiveTarget,
}

impl WatchOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            WatchOutcome::Finished => 0,
            WatchOutcome::NoActiveTarget => 1,
        }
    }
}

pub struct Supervisor {
    target_file: String,
    store: TimelineStore,
    mailbox: Mailbox,
    checkpointer: Box<dyn Checkpointer>,
    launcher: Box<dyn Launcher>,
    poll_interval: Duration,
    child: Option<Box<dyn ChildProcess>>,
    state: SupervisorState,
}

impl Supervisor {
    pub fn new(
        target_file: impl Into<String>,
        store: TimelineStore,
        mailbox: Mailbox,
        checkpointer: Box<dyn Checkpointer>,
        launcher: Box<dyn Launcher>,
    ) -> Self {
        Self {
            target_file: target_file.into(),
            store,
            mailbox,
            checkpointer,
            launcher,
            poll_interval: Duration::from_millis(100),
            child: None,
            state: SupervisorState::Idle,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Pid of the live child, if any
    pub fn child_pid(&self) -> Option<u32> {
        self.child.as_ref().map(|child| child.pid())
    }

    fn transition(&mut self, next: SupervisorState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "Supervisor state change");
            self.state = next;
        }
    }

    /// Resume at a pending rewind id, or start the target from scratch.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        let entries: Vec<Value> = self.mailbox.read(Channel::Watcher)?;
        let Some(sequence_id) = newest_rewind_id(&entries) else {
            return self.fresh_start();
        };

        self.mailbox.clear(Channel::Watcher)?;
        tracing::info!(sequence_id, "Resuming from stored pointer");
        match self.restore(sequence_id) {
            Err(SupervisorError::Checkpoint(CheckpointError::Missing(_))) => {
                tracing::warn!(
                    sequence_id,
                    "No checkpoint for the stored pointer, starting over"
                );
                self.fresh_start()
            }
            other => other,
        }
    }

    fn fresh_start(&mut self) -> Result<(), SupervisorError> {
        self.checkpointer.wipe()?;
        for channel in [
            Channel::Watcher,
            Channel::CheckpointRequests,
            Channel::CheckpointAcks,
        ] {
            self.mailbox.clear(channel)?;
        }
        self.store.clear_pointer(&self.target_file)?;

        let child = self.launcher.launch().map_err(SupervisorError::Spawn)?;
        tracing::info!(pid = child.pid(), target = %self.target_file, "Started traced child");
        self.child = Some(child);
        self.transition(SupervisorState::Spawned);
        Ok(())
    }

    /// One pass of the control loop.
    pub fn step(&mut self) -> Result<Step, SupervisorError> {
        self.service_snapshots()?;

        let pending: Vec<Value> = self.mailbox.read(Channel::Watcher)?;
        let rewind_pending = newest_rewind_id(&pending).is_some();
        if let Some(child) = self.child.as_mut() {
            match child.try_wait().map_err(SupervisorError::Child)? {
                None if rewind_pending => {
                    tracing::info!(pid = child.pid(), "Stopping child for rewind");
                    child.kill().map_err(SupervisorError::Child)?;
                }
                None => {
                    if self.state == SupervisorState::Spawned {
                        self.transition(SupervisorState::Running);
                    }
                    return Ok(Step::Running);
                }
                Some(code) => tracing::debug!(code, "Traced child exited"),
            }
        }
        self.child = None;

        let entries: Vec<Value> = self.mailbox.pop(Channel::Watcher)?;
        match newest_rewind_id(&entries) {
            Some(sequence_id) => {
                self.restore(sequence_id)?;
                Ok(Step::Running)
            }
            None => {
                self.store.clear_pointer(&self.target_file)?;
                self.transition(SupervisorState::Terminated);
                tracing::info!(target = %self.target_file, "Trace finished");
                Ok(Step::Finished)
            }
        }
    }

    fn service_snapshots(&mut self) -> Result<(), SupervisorError> {
        let requests: Vec<CheckpointRequest> = self.mailbox.pop(Channel::CheckpointRequests)?;
        for request in requests {
            let live_pid = match self.child.as_mut() {
                Some(child) => child.is_running().then(|| child.pid()),
                None => None,
            };
            if live_pid != Some(request.pid) {
                tracing::debug!(?request, ?live_pid, "Dropping stale checkpoint request");
                continue;
            }

            self.transition(SupervisorState::Snapshotting);
            match self.checkpointer.snapshot(request.pid, request.sequence_id) {
                Ok(_) => {
                    self.mailbox
                        .append(Channel::CheckpointAcks, &CheckpointAck::ok(request.sequence_id))?;
                    self.transition(SupervisorState::Continued);
                    self.transition(SupervisorState::Running);
                }
                Err(e) => {
                    tracing::error!(sequence_id = request.sequence_id, error = %e, "Snapshot failed");
                    self.mailbox.append(
                        Channel::CheckpointAcks,
                        &CheckpointAck::failed(request.sequence_id, e.to_string()),
                    )?;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Roll the pointer back to `sequence_id` and bring its snapshot back.
    pub fn restore(&mut self, sequence_id: i64) -> Result<(), SupervisorError> {
        self.transition(SupervisorState::Rewound);
        let handle = self
            .checkpointer
            .find(sequence_id)
            .ok_or(CheckpointError::Missing(sequence_id))?;

        let line = self
            .store
            .event(&self.target_file, sequence_id)?
            .map(|event| event.line_number);
        if line.is_none() {
            tracing::warn!(sequence_id, "No recorded event at the restore point");
        }
        self.store
            .set_pointer(&self.target_file, Some(sequence_id), line)?;

        // The restored image is parked waiting for the ack of its own snapshot.
        self.mailbox.clear(Channel::CheckpointRequests)?;
        self.mailbox
            .replace(Channel::CheckpointAcks, &[CheckpointAck::ok(sequence_id)])?;

        let child = self.checkpointer.restore(&handle)?;
        tracing::info!(sequence_id, pid = child.pid(), "Restored checkpoint");
        self.child = Some(child);
        self.transition(SupervisorState::Running);
        Ok(())
    }

    /// Drive the child until it finishes or `shutdown` is raised.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), SupervisorError> {
        let result = self.start().and_then(|()| self.control_loop(shutdown));
        if result.is_err() {
            self.kill_child();
        }
        result
    }

    fn control_loop(&mut self, shutdown: &AtomicBool) -> Result<(), SupervisorError> {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                tracing::info!("Shutdown requested, stopping traced child");
                self.kill_child();
                self.transition(SupervisorState::Terminated);
                return Ok(());
            }
            if self.step()? == Step::Finished {
                return Ok(());
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn kill_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                tracing::warn!(pid = child.pid(), error = %e, "Failed to kill traced child");
            }
        }
    }
}

/// Newest entry of the `watcher` channel as a sequence id, when it is one.
pub fn newest_rewind_id(entries: &[Value]) -> Option<i64> {
    match entries.last()? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Body of `rewind watch`.
pub fn watch(config: &Config, shutdown: &AtomicBool) -> Result<WatchOutcome, SupervisorError> {
    let store = TimelineStore::new(Database::open(config.paths.database())?);
    let target = match store.get_active_target() {
        Ok(target) => target,
        Err(DatabaseError::NotFound(reason)) => {
            tracing::warn!(%reason, "No active target to watch");
            return Ok(WatchOutcome::NoActiveTarget);
        }
        Err(e) => return Err(e.into()),
    };

    let data_dir: PathBuf = config.paths.data_dir().to_path_buf();
    let launcher = CommandLauncher::current_exe(
        &[],
        [
            "--data-dir".into(),
            data_dir.into_os_string(),
            "trace".into(),
            target.clone().into(),
        ],
    )
    .map_err(SupervisorError::Spawn)?
    .die_with_parent();
    let checkpointer =
        CriuCheckpointer::new(config.criu_path.clone(), config.paths.checkpoints_dir())?;

    let mut supervisor = Supervisor::new(
        target,
        store,
        Mailbox::new(config.paths.mailbox_dir()),
        Box::new(checkpointer),
        Box::new(launcher),
    )
    .with_poll_interval(config.session.poll_interval);
    supervisor.run(shutdown)?;
    Ok(WatchOutcome::Finished)
}
