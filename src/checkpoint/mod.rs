//! Process snapshot and restore.
//!
//! The watcher only talks to a [`Checkpointer`]; the real implementation
//! drives CRIU, and [`MemoryCheckpointer`] stands in for it where no OS
//! facility is available.

mod criu;
mod memory;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::supervisor::ChildProcess;

pub use criu::CriuCheckpointer;
pub use memory::{CheckpointOp, MemoryCheckpointer, Respawn};

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("criu not found (install it or set [checkpoint] criu_path)")]
    Unavailable,
    #[error("No checkpoint taken at event {0}")]
    Missing(i64),
    #[error("criu {action} for event {sequence_id} failed ({status}): {stderr}")]
    Failed {
        action: &'static str,
        sequence_id: i64,
        status: String,
        stderr: String,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Reference to a snapshot taken at one timeline position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointHandle {
    pub sequence_id: i64,
    /// Image directory, when the snapshot lives on disk
    pub location: Option<PathBuf>,
}

/// Full-process snapshots keyed by timeline position.
pub trait Checkpointer: Send {
    /// Snapshot the running process `pid` under `sequence_id`, replacing any
    /// snapshot already stored under that id. The process keeps running.
    fn snapshot(&mut self, pid: u32, sequence_id: i64) -> Result<CheckpointHandle, CheckpointError>;

    /// Bring the snapshot back as a running process.
    fn restore(&mut self, handle: &CheckpointHandle)
        -> Result<Box<dyn ChildProcess>, CheckpointError>;

    fn find(&self, sequence_id: i64) -> Option<CheckpointHandle>;

    /// Drop every snapshot.
    fn wipe(&mut self) -> Result<(), CheckpointError>;
}
