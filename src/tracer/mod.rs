//! Instrumentation tracer.
//!
//! Runs inside the traced process. Every interpreter event on a traced source
//! unit is diffed against the frame's last snapshot, snapshotted by the
//! watcher, recorded in the timeline store and published to the relay. In
//! interactive mode the script then stays suspended until a client command
//! releases it.

mod output;
mod snapshot;
mod units;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::config::Config;
use crate::data::{Database, DatabaseError, EventKind, TimelineEvent, TimelineStore};
use crate::interp::{
    ExecError, FrameView, Halt, Interpreter, Output, StdOutput, Stream, TraceEvent, TraceHook,
    INTERPRETER_STACK_SIZE,
};
use crate::mailbox::{Channel, Mailbox, MailboxError};
use crate::protocol::{ClientCommand, ServerMessage, StdinInput};
use crate::scope::{FrameScopes, ScopeDiff, SnapshotCache};

pub use output::MailboxOutput;
pub use snapshot::{NullSnapshotter, SnapshotRequester, WatcherLink};
pub use units::{find_units, SourceCache};

static NEVER_INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Checkpoint for event {sequence_id} failed: {message}")]
    Snapshot { sequence_id: i64, message: String },
    #[error("No checkpoint acknowledgement for event {sequence_id} after {polls} polls")]
    AckTimeout { sequence_id: i64, polls: u32 },
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to start the interpreter thread: {0}")]
    Thread(#[source] std::io::Error),
    #[error("Interpreter thread panicked")]
    Panicked,
    #[error("Trace halted: {0:?}")]
    Halted(Halt),
}

/// Whether the script waits for a client between events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Publish every event and block until a command releases the script
    Interactive,
    /// Record events and keep running
    AutoContinue,
}

/// How a trace run ended, short of an environment failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOutcome {
    Completed,
    /// Execution was handed to the checkpoint taken at this id
    Rewound(i64),
    Interrupted,
    /// The script raised an error nothing caught, or did not parse
    ScriptFailed,
}

impl TraceOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            TraceOutcome::Completed | TraceOutcome::Rewound(_) => 0,
            TraceOutcome::Interrupted | TraceOutcome::ScriptFailed => 1,
        }
    }
}

/// The [`TraceHook`] that drives one traced run.
pub struct Tracer {
    target_file: String,
    units: HashSet<PathBuf>,
    sources: SourceCache,
    scopes: SnapshotCache,
    sequence_id: i64,
    store: TimelineStore,
    mailbox: Mailbox,
    snapshots: Box<dyn SnapshotRequester>,
    mode: Mode,
    poll_interval: Duration,
    interrupt: &'static AtomicBool,
    replay_until: i64,
    failure: Option<TraceError>,
}

impl Tracer {
    /// Trace `target` (a canonical path) and the local modules it imports.
    pub fn new(target: &Path, store: TimelineStore, mailbox: Mailbox) -> Self {
        let units = find_units(target);
        Self {
            target_file: target.display().to_string(),
            sources: SourceCache::load(&units),
            units: units.into_iter().collect(),
            scopes: SnapshotCache::new(),
            sequence_id: 0,
            store,
            mailbox,
            snapshots: Box::new(NullSnapshotter),
            mode: Mode::Interactive,
            poll_interval: Duration::from_millis(100),
            interrupt: &NEVER_INTERRUPTED,
            replay_until: 0,
            failure: None,
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_snapshotter(mut self, snapshots: Box<dyn SnapshotRequester>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_interrupt(mut self, interrupt: &'static AtomicBool) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Re-execute silently up to event `sequence_id` and resume tracing
    /// there, reproducing the state a deterministic run had at that point.
    pub fn with_replay_until(mut self, sequence_id: i64) -> Self {
        self.replay_until = sequence_id;
        self
    }

    /// Id of the last recorded event
    pub fn sequence_id(&self) -> i64 {
        self.sequence_id
    }

    /// The error behind a `Halt::Failed`, if tracing failed
    pub fn take_failure(&mut self) -> Option<TraceError> {
        self.failure.take()
    }

    fn on_event(
        &mut self,
        frame: &mut FrameView<'_>,
        event: TraceEvent<'_>,
    ) -> Result<(), TraceError> {
        let current = FrameScopes::new(frame.globals(), frame.locals());
        self.sequence_id += 1;
        if self.sequence_id < self.replay_until {
            self.remember(frame, event, current);
            return Ok(());
        }

        // a callee has no state of its own yet; diff it against its caller
        // when both share a unit, otherwise against nothing
        let reference = match event {
            TraceEvent::Call => frame
                .back_id()
                .and_then(|id| self.scopes.get_in(id, frame.unit())),
            _ => self.scopes.get(frame.id()),
        };
        let (global_diff, local_diff) = match reference {
            Some(reference) => reference.diff_to(&current),
            None => FrameScopes::default().diff_to(&current),
        };

        let record = self.build_event(frame, event, global_diff, local_diff);

        self.snapshots.snapshot(record.sequence_id)?;
        self.store.record(&record)?;
        tracing::debug!(
            sequence_id = record.sequence_id,
            kind = record.kind.as_str(),
            line = record.line_number,
            "Recorded event"
        );

        if self.mode == Mode::Interactive {
            self.mailbox
                .append(Channel::AppToServer, &ServerMessage::Event(record))?;
            self.await_command(frame)?;
        }

        self.remember(frame, event, current);
        Ok(())
    }

    fn remember(&mut self, frame: &FrameView<'_>, event: TraceEvent<'_>, scopes: FrameScopes) {
        match event {
            TraceEvent::Call => self.scopes.seed(frame.id(), frame.unit(), scopes),
            TraceEvent::Line => self.scopes.store(frame.id(), frame.unit(), scopes),
            TraceEvent::Return(_) => self.scopes.discard(frame.id()),
            TraceEvent::Exception { .. } => {}
        }
    }

    fn build_event(
        &self,
        frame: &FrameView<'_>,
        event: TraceEvent<'_>,
        global_diff: ScopeDiff,
        local_diff: ScopeDiff,
    ) -> TimelineEvent {
        let unit = file_name(frame.unit());
        let code_name = frame.code_name();
        let (target_name, function) = if frame.is_module() {
            (unit.clone(), None)
        } else {
            (
                code_name.to_string(),
                (!code_name.starts_with('<')).then(|| code_name.to_string()),
            )
        };
        let kind = match event {
            TraceEvent::Call => EventKind::Call,
            TraceEvent::Line => EventKind::Line,
            TraceEvent::Return(value) => EventKind::Return {
                return_value: value.to_json(),
            },
            TraceEvent::Exception { error, traceback } => EventKind::Exception {
                error: error.summary(),
                traceback: traceback.to_string(),
            },
        };

        TimelineEvent {
            target_file: self.target_file.clone(),
            sequence_id: self.sequence_id,
            kind,
            target_name,
            unit,
            frame_id: frame.id(),
            function,
            line_number: frame.line(),
            source_text: self.sources.line(frame.unit(), frame.line()),
            global_diff,
            local_diff,
        }
    }

    /// Poll for commands until one releases the script.
    fn await_command(&mut self, frame: &mut FrameView<'_>) -> Result<(), TraceError> {
        loop {
            if self.interrupt.load(Ordering::SeqCst) {
                return Err(TraceError::Halted(Halt::Interrupted));
            }

            let batch: Vec<Value> = self.mailbox.pop(Channel::ServerToApp)?;
            let mut pending = batch.into_iter();
            while let Some(raw) = pending.next() {
                match ClientCommand::parse(&raw) {
                    Some(ClientCommand::Continue) => {
                        let rest: Vec<Value> = pending.collect();
                        self.mailbox.requeue(Channel::ServerToApp, &rest)?;
                        return Ok(());
                    }
                    Some(ClientCommand::Rewind(id)) if (1..=self.sequence_id).contains(&id) => {
                        let rest: Vec<Value> = pending.collect();
                        self.mailbox.requeue(Channel::ServerToApp, &rest)?;
                        self.mailbox.append(Channel::Watcher, &id)?;
                        tracing::info!(sequence_id = id, "Handing off to the watcher for rewind");
                        return Err(TraceError::Halted(Halt::Rewind(id)));
                    }
                    Some(ClientCommand::Rewind(id)) => self.report(format!(
                        "cannot rewind to {id}: recorded ids are 1..={}\n",
                        self.sequence_id
                    ))?,
                    Some(ClientCommand::UpdateNodeCode {
                        lineno,
                        code_segment,
                    }) => self.report(format!(
                        "edit of line {lineno} to {code_segment:?} is not applied yet\n"
                    ))?,
                    Some(ClientCommand::Stdin(input)) => self.apply_stdin(frame, input)?,
                    None => tracing::debug!(message = %raw, "Ignoring unrecognized command"),
                }
            }

            std::thread::sleep(self.poll_interval);
        }
    }

    fn apply_stdin(
        &mut self,
        frame: &mut FrameView<'_>,
        input: StdinInput,
    ) -> Result<(), TraceError> {
        match input {
            StdinInput::Jump(line) => match u32::try_from(line) {
                Ok(target) => match frame.request_jump(target) {
                    Ok(()) => tracing::debug!(line, "Jump requested"),
                    Err(e) => self.report(format!("cannot jump: {e}\n"))?,
                },
                Err(_) => self.report(format!("cannot jump: {line} is not a line number\n"))?,
            },
            StdinInput::Assign { name, value } => {
                tracing::debug!(%name, "Rebinding variable");
                frame.assign(&name, &value);
            }
            StdinInput::Invalid(text) => self.report(format!(
                "unrecognized input {text:?}: send a line number or `name = <json>`\n"
            ))?,
        }
        Ok(())
    }

    /// Tell the client something on the script's stderr stream.
    fn report(&self, text: String) -> Result<(), TraceError> {
        self.mailbox
            .append(Channel::AppToServer, &ServerMessage::Stderr(text))?;
        Ok(())
    }
}

impl TraceHook for Tracer {
    fn trace(&mut self, frame: &mut FrameView<'_>, event: TraceEvent<'_>) -> Result<(), Halt> {
        if !self.units.contains(frame.unit()) {
            return Ok(());
        }
        if self.interrupt.load(Ordering::SeqCst) {
            return Err(Halt::Interrupted);
        }
        match self.on_event(frame, event) {
            Ok(()) => Ok(()),
            Err(TraceError::Halted(halt)) => Err(halt),
            Err(e) => {
                tracing::error!(error = %e, "Tracing failed");
                let message = e.to_string();
                self.failure = Some(e);
                Err(Halt::Failed(message))
            }
        }
    }
}

fn file_name(unit: &Path) -> String {
    unit.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| unit.display().to_string())
}

/// Run `script` under the tracer on a thread with a deep stack.
///
/// Interactive runs publish events, wait for commands and request a
/// checkpoint from the watcher before each event is recorded; standalone
/// runs record events and print output to the terminal.
pub fn run(
    config: &Config,
    script: &Path,
    standalone: bool,
    interrupt: &'static AtomicBool,
) -> Result<TraceOutcome, TraceError> {
    let script = script.canonicalize().map_err(|source| TraceError::Io {
        path: script.to_path_buf(),
        source,
    })?;
    let config = config.clone();

    let handle = std::thread::Builder::new()
        .name("interpreter".into())
        .stack_size(INTERPRETER_STACK_SIZE)
        .spawn(move || trace_script(&config, &script, standalone, interrupt))
        .map_err(TraceError::Thread)?;
    handle.join().map_err(|_| TraceError::Panicked)?
}

fn trace_script(
    config: &Config,
    script: &Path,
    standalone: bool,
    interrupt: &'static AtomicBool,
) -> Result<TraceOutcome, TraceError> {
    let store = TimelineStore::new(Database::open(config.paths.database())?);
    let mailbox = Mailbox::new(config.paths.mailbox_dir());
    let target_file = script.display().to_string();

    let (mode, snapshots, mut output): (Mode, Box<dyn SnapshotRequester>, Box<dyn Output>) =
        if standalone {
            store.register_target(&target_file)?;
            (Mode::AutoContinue, Box::new(NullSnapshotter), Box::new(StdOutput))
        } else {
            store.ensure_target(&target_file)?;
            (
                Mode::Interactive,
                Box::new(WatcherLink::new(mailbox.clone(), &config.session, interrupt)),
                Box::new(MailboxOutput::new(mailbox.clone())),
            )
        };

    let mut tracer = Tracer::new(script, store, mailbox)
        .with_mode(mode)
        .with_snapshotter(snapshots)
        .with_poll_interval(config.session.poll_interval)
        .with_interrupt(interrupt);

    tracing::info!(target = %target_file, ?mode, "Tracing script");
    let result = Interpreter::new(output.as_mut())
        .with_hook(&mut tracer)
        .run_file(script);

    let outcome = match result {
        Ok(()) => TraceOutcome::Completed,
        Err(ExecError::Halt(Halt::Rewind(id))) => TraceOutcome::Rewound(id),
        Err(ExecError::Halt(Halt::Interrupted)) => TraceOutcome::Interrupted,
        Err(ExecError::Halt(Halt::Failed(message))) => {
            return Err(tracer
                .take_failure()
                .unwrap_or(TraceError::Halted(Halt::Failed(message))));
        }
        Err(ExecError::Runtime { error, rendered }) => {
            tracing::info!(error = %error, "Script raised an uncaught error");
            output.write(Stream::Stderr, &rendered);
            output.flush(Stream::Stderr);
            TraceOutcome::ScriptFailed
        }
        Err(ExecError::Syntax(e)) => {
            output.write(
                Stream::Stderr,
                &format!(
                    "  File \"{}\", line {}\n{}: {}\n",
                    script.display(),
                    e.line,
                    e.kind,
                    e.message
                ),
            );
            output.flush(Stream::Stderr);
            TraceOutcome::ScriptFailed
        }
        Err(ExecError::Io { path, source }) => {
            return Err(TraceError::Io {
                path: path.into(),
                source,
            })
        }
    };

    tracing::info!(?outcome, events = tracer.sequence_id(), "Trace finished");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::CapturedOutput;
    use crate::scope::Change;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        script: PathBuf,
        store: TimelineStore,
        mailbox: Mailbox,
    }

    fn fixture(files: &[(&str, &str)]) -> Fixture {
        let dir = tempdir().unwrap();
        for (name, text) in files {
            let path = dir.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, text).unwrap();
        }
        let script = dir.path().join("main.py");
        let store = TimelineStore::new(Database::open(dir.path().join("trace.db")).unwrap());
        store.register_target(&script.display().to_string()).unwrap();
        let mailbox = Mailbox::new(dir.path().join("mailbox"));
        Fixture {
            _dir: dir,
            script,
            store,
            mailbox,
        }
    }

    fn execute(tracer: &mut Tracer, script: &Path) -> (Result<(), ExecError>, CapturedOutput) {
        let output = CapturedOutput::new();
        let mut sink = output.clone();
        let result = Interpreter::new(&mut sink)
            .with_hook(tracer)
            .run_file(script);
        (result, output)
    }

    /// Records which ids were snapshotted and whether they were already durable.
    struct ProbeSnapshots {
        store: TimelineStore,
        file: String,
        seen: Arc<Mutex<Vec<(i64, bool)>>>,
    }

    impl SnapshotRequester for ProbeSnapshots {
        fn snapshot(&mut self, sequence_id: i64) -> Result<(), TraceError> {
            let durable = self.store.event(&self.file, sequence_id)?.is_some();
            self.seen.lock().unwrap().push((sequence_id, durable));
            Ok(())
        }
    }

    #[test]
    fn test_function_call_records_minimal_diffs() {
        let fx = fixture(&[("main.py", "def f():\n    x = 1\n    x = 2\nf()\n")]);
        let mut tracer = Tracer::new(&fx.script, fx.store.clone(), fx.mailbox.clone())
            .with_mode(Mode::AutoContinue);
        let (result, _) = execute(&mut tracer, &fx.script);
        result.unwrap();

        let file = fx.script.display().to_string();
        let events = fx.store.all_events(&file).unwrap();
        let ids: Vec<i64> = events.iter().map(|e| e.sequence_id).collect();
        assert_eq!(ids, (1..=8).collect::<Vec<_>>());

        let shape: Vec<(&str, &str, u32)> = events
            .iter()
            .map(|e| (e.kind.as_str(), e.target_name.as_str(), e.line_number))
            .collect();
        assert_eq!(
            shape,
            vec![
                ("call", "main.py", 1),
                ("line", "main.py", 1),
                ("line", "main.py", 4),
                ("call", "f", 1),
                ("line", "f", 2),
                ("line", "f", 3),
                ("return", "f", 3),
                ("return", "main.py", 4),
            ]
        );

        assert_eq!(events[0].function, None);
        assert_eq!(events[3].function.as_deref(), Some("f"));
        assert!(events[3].global_diff.is_empty());
        assert_eq!(
            serde_json::to_value(&events[5].local_diff).unwrap(),
            json!({"x": 1})
        );
        assert_eq!(
            serde_json::to_value(&events[6].local_diff).unwrap(),
            json!({"x": 2})
        );
        assert_eq!(
            events[6].kind,
            EventKind::Return {
                return_value: Value::Null
            }
        );
        assert_eq!(events[4].source_text, "x = 1");

        let pointer = fx.store.get_pointer(&file).unwrap();
        assert_eq!(pointer.last_sequence_id, Some(8));
        assert_eq!(pointer.last_line_number, Some(4));
        assert!(fx.mailbox.read_raw(Channel::AppToServer).unwrap().is_empty());
    }

    #[test]
    fn test_replay_resumes_with_identical_records() {
        let source = "def add(a, b):\n    c = a + b\n    return c\ntotal = add(1, 2)\ntotal = add(total, 4)\n";
        let fx = fixture(&[("main.py", source)]);
        let file = fx.script.display().to_string();
        let mut tracer = Tracer::new(&fx.script, fx.store.clone(), fx.mailbox.clone())
            .with_mode(Mode::AutoContinue);
        execute(&mut tracer, &fx.script).0.unwrap();
        let original = fx.store.all_events(&file).unwrap();

        fx.store.register_target(&file).unwrap();
        let mut resumed = Tracer::new(&fx.script, fx.store.clone(), fx.mailbox.clone())
            .with_mode(Mode::AutoContinue)
            .with_replay_until(9);
        execute(&mut resumed, &fx.script).0.unwrap();
        let replayed = fx.store.all_events(&file).unwrap();

        assert_eq!(replayed.first().map(|e| e.sequence_id), Some(9));
        assert_eq!(replayed[..], original[8..]);
    }

    #[test]
    fn test_snapshot_precedes_recording() {
        let fx = fixture(&[("main.py", "a = 1\nb = a + 1\n")]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let probe = ProbeSnapshots {
            store: fx.store.clone(),
            file: fx.script.display().to_string(),
            seen: seen.clone(),
        };
        let mut tracer = Tracer::new(&fx.script, fx.store.clone(), fx.mailbox.clone())
            .with_mode(Mode::AutoContinue)
            .with_snapshotter(Box::new(probe));
        execute(&mut tracer, &fx.script).0.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![(1, false), (2, false), (3, false), (4, false)]
        );
    }

    #[test]
    fn test_exception_events_carry_the_error() {
        let fx = fixture(&[(
            "main.py",
            "def f():\n    return {}['k']\ntry:\n    f()\nexcept KeyError:\n    pass\n",
        )]);
        let mut tracer = Tracer::new(&fx.script, fx.store.clone(), fx.mailbox.clone())
            .with_mode(Mode::AutoContinue);
        execute(&mut tracer, &fx.script).0.unwrap();

        let events = fx.store.all_events(&fx.script.display().to_string()).unwrap();
        let exceptions: Vec<&TimelineEvent> = events
            .iter()
            .filter(|e| e.kind.as_str() == "exception")
            .collect();
        assert_eq!(exceptions.len(), 2);
        match &exceptions[0].kind {
            EventKind::Exception { error, traceback } => {
                assert_eq!(error, "KeyError: 'k'");
                assert!(traceback.contains("in f"));
            }
            other => panic!("expected exception, got {other:?}"),
        }
        assert_eq!(exceptions[1].target_name, "main.py");
    }

    #[test]
    fn test_only_traced_units_are_recorded() {
        let fx = fixture(&[
            ("main.py", "import pkg\nimport helper\nprint(pkg.VALUE + helper.twice(1))\n"),
            ("pkg/__init__.py", "VALUE = 3\n"),
            ("helper.py", "def twice(x):\n    return x * 2\n"),
        ]);
        let mut tracer = Tracer::new(&fx.script, fx.store.clone(), fx.mailbox.clone())
            .with_mode(Mode::AutoContinue);
        let (result, output) = execute(&mut tracer, &fx.script);
        result.unwrap();
        assert_eq!(output.stdout(), "5\n");

        let events = fx.store.all_events(&fx.script.display().to_string()).unwrap();
        let units: HashSet<&str> = events.iter().map(|e| e.unit.as_str()).collect();
        assert_eq!(units, HashSet::from(["main.py", "helper.py"]));
        assert!(events
            .iter()
            .any(|e| e.unit == "helper.py" && e.target_name == "helper.py"));
    }

    #[test]
    fn test_interrupt_stops_a_running_trace() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("spin.py");
        std::fs::write(&script, "n = 0\nwhile True:\n    n = n + 1\n").unwrap();
        let config = Config::new(crate::util::Paths::new(dir.path()));

        let interrupt: &'static AtomicBool = Box::leak(Box::new(AtomicBool::new(false)));
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            interrupt.store(true, Ordering::SeqCst);
        });
        let outcome = run(&config, &script, true, interrupt).unwrap();
        stopper.join().unwrap();

        assert_eq!(outcome, TraceOutcome::Interrupted);
        assert_eq!(outcome.exit_code(), 1);
        let store = TimelineStore::new(Database::open(config.paths.database()).unwrap());
        let file = script.canonicalize().unwrap().display().to_string();
        assert!(!store.all_events(&file).unwrap().is_empty());
    }

    #[test]
    fn test_marker_shaped_value_is_stored_as_a_value() {
        let fx = fixture(&[("main.py", "x = {'__removed__': True}\ny = 1\n")]);
        let mut tracer = Tracer::new(&fx.script, fx.store.clone(), fx.mailbox.clone())
            .with_mode(Mode::AutoContinue);
        execute(&mut tracer, &fx.script).0.unwrap();

        let file = fx.script.display().to_string();
        // 1 call, 2 line 1, 3 line 2, 4 return
        let stored = fx.store.event(&file, 3).unwrap().unwrap();
        assert_eq!(
            stored.global_diff.get("x"),
            Some(&Change::Set(json!({"__removed__": true})))
        );
        assert_eq!(stored.line_number, 2);
    }

    #[test]
    fn test_call_into_other_unit_diffs_against_its_own_globals() {
        let fx = fixture(&[
            ("main.py", "import helper\nA = 1\nB = 2\nhelper.f()\n"),
            ("helper.py", "def f():\n    return 1\n"),
        ]);
        let mut tracer = Tracer::new(&fx.script, fx.store.clone(), fx.mailbox.clone())
            .with_mode(Mode::AutoContinue);
        execute(&mut tracer, &fx.script).0.unwrap();

        let events = fx.store.all_events(&fx.script.display().to_string()).unwrap();
        let call = events
            .iter()
            .find(|e| e.unit == "helper.py" && e.kind.as_str() == "call" && e.target_name == "f")
            .unwrap();
        let keys: Vec<&str> = call.global_diff.keys().collect();
        assert_eq!(keys, vec!["f"]);
        assert!(events
            .iter()
            .filter(|e| e.unit == "helper.py")
            .all(|e| e.global_diff.iter().all(|(_, c)| *c != Change::Removed)));
    }

    /// Plays the client: answers each published event with the commands
    /// `respond` returns, and collects stderr messages, until a rewind is sent.
    fn run_client(
        mailbox: Mailbox,
        respond: impl Fn(i64) -> Vec<Value> + Send + 'static,
    ) -> std::thread::JoinHandle<Vec<String>> {
        std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(10);
            let mut stderr = Vec::new();
            while Instant::now() < deadline {
                let messages: Vec<Value> = mailbox.pop(Channel::AppToServer).unwrap();
                for message in messages {
                    match message["type"].as_str() {
                        Some("event") => {
                            let id = message["data"]["id"].as_i64().unwrap();
                            let commands = respond(id);
                            let done = commands.iter().any(|c| c["type"] == "new_timeline_id");
                            for command in commands {
                                mailbox.append(Channel::ServerToApp, &command).unwrap();
                            }
                            if done {
                                return stderr;
                            }
                        }
                        Some("stderr") => {
                            stderr.push(message["data"].as_str().unwrap().to_string())
                        }
                        _ => {}
                    }
                }
                std::thread::sleep(Duration::from_millis(2));
            }
            stderr
        })
    }

    #[test]
    fn test_interactive_commands() {
        let fx = fixture(&[("main.py", "x = 1\nx = 2\nprint(x)\n")]);
        // 1 call, 2 line 1, 3 line 2, 4 line 3, 5 return
        let client = run_client(fx.mailbox.clone(), |id| match id {
            2 => vec![json!({"type": "update_node_code", "lineno": 1, "code_segment": "x = 5"}), json!({"type": "continue"})],
            4 => vec![json!({"type": "stdin", "data": "x = 40"}), json!({"type": "stdin", "data": "hello"}), json!({"type": "continue"})],
            5 => vec![
                json!({"type": "new_timeline_id", "new_timeline_id": 99}),
                json!({"type": "new_timeline_id", "new_timeline_id": 2}),
            ],
            _ => vec![json!({"type": "continue"})],
        });

        let mut tracer = Tracer::new(&fx.script, fx.store.clone(), fx.mailbox.clone())
            .with_poll_interval(Duration::from_millis(2));
        let (result, output) = execute(&mut tracer, &fx.script);
        let mut stderr = client.join().unwrap();
        // the client stops reading once it has asked for the rewind
        let tail: Vec<Value> = fx.mailbox.pop(Channel::AppToServer).unwrap();
        stderr.extend(
            tail.iter()
                .filter(|m| m["type"] == "stderr")
                .map(|m| m["data"].as_str().unwrap().to_string()),
        );

        assert!(matches!(result, Err(ExecError::Halt(Halt::Rewind(2)))));
        assert_eq!(output.stdout(), "40\n");
        assert_eq!(fx.mailbox.read::<i64>(Channel::Watcher).unwrap(), vec![2]);
        assert_eq!(stderr.len(), 3);
        assert!(stderr[0].contains("not applied yet"));
        assert!(stderr[1].contains("unrecognized input"));
        assert!(stderr[2].contains("cannot rewind to 99"));
    }

    #[test]
    fn test_continue_leaves_later_commands_queued() {
        let fx = fixture(&[("main.py", "x = 1\n")]);
        fx.mailbox
            .append(Channel::ServerToApp, &json!({"type": "continue"}))
            .unwrap();
        fx.mailbox
            .append(Channel::ServerToApp, &json!({"type": "stdin", "data": "x = 9"}))
            .unwrap();
        fx.mailbox
            .append(Channel::ServerToApp, &json!({"type": "continue"}))
            .unwrap();
        fx.mailbox
            .append(Channel::ServerToApp, &json!({"type": "continue"}))
            .unwrap();
        fx.mailbox
            .append(Channel::ServerToApp, &json!({"type": "continue"}))
            .unwrap();

        let mut tracer = Tracer::new(&fx.script, fx.store.clone(), fx.mailbox.clone())
            .with_poll_interval(Duration::from_millis(2));
        execute(&mut tracer, &fx.script).0.unwrap();

        // call, line 1 and return consumed one continue each; the assignment
        // ran at line 1 before `x = 1` executed
        let left: Vec<Value> = fx.mailbox.read(Channel::ServerToApp).unwrap();
        assert_eq!(left, vec![json!({"type": "continue"})]);
        let events = fx.store.all_events(&fx.script.display().to_string()).unwrap();
        assert_eq!(
            serde_json::to_value(&events[2].global_diff).unwrap(),
            json!({"x": 1})
        );
    }

    #[test]
    fn test_jump_from_stdin() {
        let fx = fixture(&[("main.py", "n = 0\nn = n + 1\nprint(n)\n")]);
        // 1 call, 2 line 1, 3 line 2, 4 line 3 jumps back; 5 line 2, 6 line 3, 7 return
        let client = run_client(fx.mailbox.clone(), |id| match id {
            4 => vec![json!({"type": "stdin", "data": 2}), json!({"type": "continue"})],
            7 => vec![json!({"type": "new_timeline_id", "new_timeline_id": 1})],
            _ => vec![json!({"type": "continue"})],
        });

        let mut tracer = Tracer::new(&fx.script, fx.store.clone(), fx.mailbox.clone())
            .with_poll_interval(Duration::from_millis(2));
        let (result, output) = execute(&mut tracer, &fx.script);
        client.join().unwrap();

        assert!(matches!(result, Err(ExecError::Halt(Halt::Rewind(1)))));
        assert_eq!(output.stdout(), "2\n");
    }
}
