//! Checkpoint handshake between the tracer and the watcher

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::TraceError;
use crate::config::SessionSettings;
use crate::interp::Halt;
use crate::mailbox::{Channel, Mailbox};
use crate::protocol::{CheckpointAck, CheckpointRequest};

/// Gets the traced process snapshotted before an event becomes durable.
pub trait SnapshotRequester {
    /// Block until the process has been snapshotted under `sequence_id`.
    fn snapshot(&mut self, sequence_id: i64) -> Result<(), TraceError>;
}

/// Takes no snapshots. Used by standalone runs, which cannot be rewound.
#[derive(Debug, Default)]
pub struct NullSnapshotter;

impl SnapshotRequester for NullSnapshotter {
    fn snapshot(&mut self, _sequence_id: i64) -> Result<(), TraceError> {
        Ok(())
    }
}

/// Asks the watcher for a snapshot over the mailbox and waits for its ack.
///
/// The wait is bounded by a number of polls rather than a deadline: a
/// process restored from a snapshot resumes inside this wait, and the time
/// it spent frozen must not count against it.
#[derive(Debug)]
pub struct WatcherLink {
    mailbox: Mailbox,
    pid: u32,
    poll_interval: Duration,
    ack_poll_budget: u32,
    interrupt: &'static AtomicBool,
}

impl WatcherLink {
    pub fn new(mailbox: Mailbox, settings: &SessionSettings, interrupt: &'static AtomicBool) -> Self {
        Self {
            mailbox,
            pid: std::process::id(),
            poll_interval: settings.poll_interval,
            ack_poll_budget: settings.ack_poll_budget,
            interrupt,
        }
    }
}

impl SnapshotRequester for WatcherLink {
    fn snapshot(&mut self, sequence_id: i64) -> Result<(), TraceError> {
        self.mailbox.append(
            Channel::CheckpointRequests,
            &CheckpointRequest {
                sequence_id,
                pid: self.pid,
            },
        )?;

        for _ in 0..self.ack_poll_budget {
            if self.interrupt.load(Ordering::SeqCst) {
                return Err(TraceError::Halted(Halt::Interrupted));
            }
            // acks for other ids are stale leftovers of an abandoned branch
            let acks: Vec<CheckpointAck> = self.mailbox.pop(Channel::CheckpointAcks)?;
            if let Some(ack) = acks.into_iter().find(|ack| ack.sequence_id == sequence_id) {
                if ack.ok {
                    return Ok(());
                }
                return Err(TraceError::Snapshot {
                    sequence_id,
                    message: ack.error.unwrap_or_else(|| "unknown error".into()),
                });
            }
            std::thread::sleep(self.poll_interval);
        }

        Err(TraceError::AckTimeout {
            sequence_id,
            polls: self.ack_poll_budget,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    static CALM: AtomicBool = AtomicBool::new(false);

    fn link(mailbox: &Mailbox, budget: u32) -> WatcherLink {
        let settings = SessionSettings {
            poll_interval: Duration::from_millis(5),
            ack_poll_budget: budget,
            ..SessionSettings::default()
        };
        WatcherLink::new(mailbox.clone(), &settings, &CALM)
    }

    #[test]
    fn test_waits_for_the_matching_ack() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::new(dir.path());
        let mut link = link(&mailbox, 400);

        let watcher = {
            let mailbox = mailbox.clone();
            std::thread::spawn(move || loop {
                let requests: Vec<CheckpointRequest> =
                    mailbox.pop(Channel::CheckpointRequests).unwrap();
                if let Some(request) = requests.first() {
                    mailbox
                        .append(Channel::CheckpointAcks, &CheckpointAck::ok(request.sequence_id - 1))
                        .unwrap();
                    mailbox
                        .append(Channel::CheckpointAcks, &CheckpointAck::ok(request.sequence_id))
                        .unwrap();
                    return *request;
                }
                std::thread::sleep(Duration::from_millis(5));
            })
        };

        link.snapshot(3).unwrap();
        let request = watcher.join().unwrap();
        assert_eq!(request.sequence_id, 3);
        assert_eq!(request.pid, std::process::id());
    }

    #[test]
    fn test_failed_ack_is_an_error() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::new(dir.path());
        mailbox
            .append(Channel::CheckpointAcks, &CheckpointAck::failed(1, "criu exited 1"))
            .unwrap();

        match link(&mailbox, 10).snapshot(1) {
            Err(TraceError::Snapshot { sequence_id, message }) => {
                assert_eq!(sequence_id, 1);
                assert_eq!(message, "criu exited 1");
            }
            other => panic!("expected snapshot failure, got {other:?}"),
        }
    }

    #[test]
    fn test_gives_up_after_the_poll_budget() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::new(dir.path());
        assert!(matches!(
            link(&mailbox, 3).snapshot(1),
            Err(TraceError::AckTimeout { polls: 3, .. })
        ));
    }
}
