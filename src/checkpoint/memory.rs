use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{CheckpointError, CheckpointHandle, Checkpointer};
use crate::supervisor::ChildProcess;

/// Starts a process that picks up execution at the given event, standing in
/// for restoring a process image.
pub type Respawn = Box<dyn FnMut(i64) -> io::Result<Box<dyn ChildProcess>> + Send>;

/// What a [`MemoryCheckpointer`] was asked to do, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOp {
    Snapshot(i64),
    Restore(i64),
    Wipe,
}

/// Checkpointer that keeps no process image.
///
/// Snapshots only remember which ids were taken. Restoring hands the id to
/// a [`Respawn`] callback, which is expected to re-run the deterministic
/// target silently up to that event and resume from there.
pub struct MemoryCheckpointer {
    taken: BTreeMap<i64, u32>,
    respawn: Respawn,
    journal: Arc<Mutex<Vec<CheckpointOp>>>,
}

impl MemoryCheckpointer {
    pub fn new(respawn: Respawn) -> Self {
        Self {
            taken: BTreeMap::new(),
            respawn,
            journal: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared view of every operation performed so far
    pub fn journal(&self) -> Arc<Mutex<Vec<CheckpointOp>>> {
        self.journal.clone()
    }
}

impl Checkpointer for MemoryCheckpointer {
    fn snapshot(&mut self, pid: u32, sequence_id: i64) -> Result<CheckpointHandle, CheckpointError> {
        self.taken.insert(sequence_id, pid);
        self.journal.lock().push(CheckpointOp::Snapshot(sequence_id));
        Ok(CheckpointHandle {
            sequence_id,
            location: None,
        })
    }

    fn restore(
        &mut self,
        handle: &CheckpointHandle,
    ) -> Result<Box<dyn ChildProcess>, CheckpointError> {
        if !self.taken.contains_key(&handle.sequence_id) {
            return Err(CheckpointError::Missing(handle.sequence_id));
        }
        self.journal
            .lock()
            .push(CheckpointOp::Restore(handle.sequence_id));
        Ok((self.respawn)(handle.sequence_id)?)
    }

    fn find(&self, sequence_id: i64) -> Option<CheckpointHandle> {
        self.taken.contains_key(&sequence_id).then_some(CheckpointHandle {
            sequence_id,
            location: None,
        })
    }

    fn wipe(&mut self) -> Result<(), CheckpointError> {
        self.taken.clear();
        self.journal.lock().push(CheckpointOp::Wipe);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Exited;

    impl ChildProcess for Exited {
        fn pid(&self) -> u32 {
            1
        }

        fn try_wait(&mut self) -> io::Result<Option<i32>> {
            Ok(Some(0))
        }

        fn kill(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_restore_requires_a_snapshot() {
        let resumed = Arc::new(Mutex::new(Vec::new()));
        let seen = resumed.clone();
        let mut checkpoints = MemoryCheckpointer::new(Box::new(move |id| {
            seen.lock().push(id);
            Ok(Box::new(Exited) as Box<dyn ChildProcess>)
        }));
        let journal = checkpoints.journal();

        let handle = checkpoints.snapshot(42, 2).unwrap();
        assert_eq!(checkpoints.find(2), Some(handle.clone()));
        assert_eq!(checkpoints.find(3), None);

        checkpoints.restore(&handle).unwrap();
        assert_eq!(*resumed.lock(), vec![2]);

        checkpoints.wipe().unwrap();
        assert!(matches!(
            checkpoints.restore(&handle),
            Err(CheckpointError::Missing(2))
        ));
        assert_eq!(
            *journal.lock(),
            vec![
                CheckpointOp::Snapshot(2),
                CheckpointOp::Restore(2),
                CheckpointOp::Wipe
            ]
        );
    }
}
