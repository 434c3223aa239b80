//! Integration tests for the step/rewind protocol
//!
//! Drives a supervisor, its tracer and a scripted client through the
//! mailbox, with an in-memory checkpointer standing in for CRIU.

use std::time::{Duration, Instant};

use super::common::fixtures::{TraceTarget, POLL};
use rewind::mailbox::Channel;
use rewind::supervisor::Step;
use rewind::{Mailbox, Supervisor, TimelineEvent};
use serde_json::{json, Value};
use tempfile::TempDir;

const LOOP: &str = "total = 0\nfor i in range(3):\n    total = total + i\nprint(total)\n";

fn send(mailbox: &Mailbox, command: Value) {
    mailbox.append(Channel::ServerToApp, &command).unwrap();
}

/// Step the supervisor until the trace finishes, answering every published
/// event with whatever `on_event` sends. Returns the script's stdout.
fn drive(
    supervisor: &mut Supervisor,
    mailbox: &Mailbox,
    mut on_event: impl FnMut(i64, &Mailbox),
) -> String {
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut stdout = String::new();
    loop {
        assert!(Instant::now() < deadline, "trace did not finish in time");
        let step = supervisor.step().unwrap();
        for message in mailbox.pop::<Value>(Channel::AppToServer).unwrap() {
            match message["type"].as_str() {
                Some("stdout") => stdout.push_str(message["data"].as_str().unwrap()),
                Some("event") => on_event(message["data"]["id"].as_i64().unwrap(), mailbox),
                _ => {}
            }
        }
        if step == Step::Finished {
            return stdout;
        }
        std::thread::sleep(POLL);
    }
}

fn ids(events: &[TimelineEvent]) -> Vec<i64> {
    events.iter().map(|e| e.sequence_id).collect()
}

#[test]
fn test_unrewound_run_has_contiguous_ids() {
    let dir = TempDir::new().unwrap();
    let target = TraceTarget::new(&dir, LOOP);
    let mut supervisor = target.supervisor();
    supervisor.start().unwrap();

    let stdout = drive(&mut supervisor, &target.mailbox, |_, mailbox| {
        send(mailbox, json!({"type": "continue"}))
    });

    assert_eq!(stdout, "3\n");
    let events = target.store.all_events(&target.file).unwrap();
    assert_eq!(ids(&events), (1..=11).collect::<Vec<_>>());
    // the finished run leaves no rewindable session behind
    assert!(target.store.get_pointer(&target.file).unwrap().is_cleared());
}

#[test]
fn test_rewind_keeps_prefix_and_overwrites_continuation() {
    let dir = TempDir::new().unwrap();
    let target = TraceTarget::new(&dir, LOOP);
    let mut supervisor = target.supervisor();
    supervisor.start().unwrap();

    let mut before_rewind: Option<Vec<TimelineEvent>> = None;
    let mut assigned = false;
    let store = target.store.clone();
    let file = target.file.clone();
    let stdout = drive(&mut supervisor, &target.mailbox, |id, mailbox| {
        if id == 6 && before_rewind.is_none() {
            before_rewind = Some(store.all_events(&file).unwrap());
            send(mailbox, json!(4));
        } else if id == 4 && before_rewind.is_some() && !assigned {
            // the restored process is parked at event 4 again
            assigned = true;
            send(mailbox, json!({"type": "stdin", "data": "total = 100"}));
            send(mailbox, json!({"type": "continue"}));
        } else {
            send(mailbox, json!({"type": "continue"}));
        }
    });

    assert!(assigned, "the rewound process never reached event 4");
    assert_eq!(stdout, "103\n");

    let before = before_rewind.unwrap();
    assert_eq!(ids(&before), (1..=6).collect::<Vec<_>>());
    let after = target.store.all_events(&target.file).unwrap();
    assert_eq!(ids(&after), (1..=11).collect::<Vec<_>>());

    assert_eq!(&after[..4], &before[..4]);
    assert_ne!(after[4].global_diff, before[4].global_diff);
    assert_eq!(
        serde_json::to_value(&after[4].global_diff).unwrap(),
        json!({"total": 100})
    );
}

#[test]
fn test_out_of_range_rewind_is_reported_not_obeyed() {
    let dir = TempDir::new().unwrap();
    let target = TraceTarget::new(&dir, "x = 1\ny = 2\n");
    let mut supervisor = target.supervisor();
    supervisor.start().unwrap();

    let mut rejected = false;
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        assert!(Instant::now() < deadline, "trace did not finish in time");
        let step = supervisor.step().unwrap();
        for message in target.mailbox.pop::<Value>(Channel::AppToServer).unwrap() {
            match message["type"].as_str() {
                Some("event") if message["data"]["id"] == json!(2) && !rejected => {
                    rejected = true;
                    send(&target.mailbox, json!(9));
                    send(&target.mailbox, json!({"type": "continue"}));
                }
                Some("event") => send(&target.mailbox, json!({"type": "continue"})),
                Some("stderr") => {
                    assert!(message["data"].as_str().unwrap().contains("cannot rewind to 9"))
                }
                _ => {}
            }
        }
        if step == Step::Finished {
            break;
        }
        std::thread::sleep(POLL);
    }

    assert!(rejected);
    assert_eq!(
        ids(&target.store.all_events(&target.file).unwrap()),
        vec![1, 2, 3, 4]
    );
}
