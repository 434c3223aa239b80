//! State directory and traced-process fixtures
//!
//! A [`TraceTarget`] owns a temporary data directory with one registered,
//! active target script. Its tracers run on threads of the test process, so
//! a [`MemoryCheckpointer`] can "restore" one by starting a new thread that
//! replays the deterministic script silently up to the restored event.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use rewind::config::{Config, SessionSettings};
use rewind::interp::Interpreter;
use rewind::supervisor::{ChildProcess, Launcher};
use rewind::tracer::{MailboxOutput, Tracer, WatcherLink};
use rewind::{Database, Mailbox, MemoryCheckpointer, Paths, Supervisor, TimelineStore};
use tempfile::TempDir;

pub const POLL: Duration = Duration::from_millis(2);

/// A registered target script in its own state directory
#[derive(Clone)]
pub struct TraceTarget {
    pub script: PathBuf,
    pub file: String,
    pub store: TimelineStore,
    pub mailbox: Mailbox,
    pub settings: SessionSettings,
}

impl TraceTarget {
    /// Write `source` as the target and make it active
    pub fn new(dir: &TempDir, source: &str) -> Self {
        let config = Config::new(Paths::new(dir.path()));
        let script = config.target_script();
        std::fs::create_dir_all(script.parent().unwrap()).unwrap();
        std::fs::write(&script, source).unwrap();
        let script = script.canonicalize().unwrap();
        let file = script.display().to_string();

        let store = TimelineStore::new(Database::open(config.paths.database()).unwrap());
        store.register_target(&file).unwrap();
        store.set_active_target(&file).unwrap();

        let mut settings = config.session.clone();
        settings.poll_interval = POLL;
        settings.ack_poll_budget = 5_000;

        Self {
            script,
            file,
            store,
            mailbox: Mailbox::new(config.paths.mailbox_dir()),
            settings,
        }
    }

    /// Start an interactive tracer that stays silent before `replay_until`
    pub fn spawn(&self, replay_until: i64) -> ThreadTracer {
        // Each tracer gets its own stop flag; it must outlive the thread.
        let stop: &'static AtomicBool = Box::leak(Box::new(AtomicBool::new(false)));
        let target = self.clone();

        let handle = std::thread::Builder::new()
            .name(format!("tracer-{replay_until}"))
            .stack_size(64 * 1024 * 1024)
            .spawn(move || {
                let mut output = MailboxOutput::new(target.mailbox.clone());
                let link = WatcherLink::new(target.mailbox.clone(), &target.settings, stop);
                let mut tracer = Tracer::new(&target.script, target.store, target.mailbox)
                    .with_snapshotter(Box::new(link))
                    .with_poll_interval(POLL)
                    .with_interrupt(stop)
                    .with_replay_until(replay_until);
                let _ = Interpreter::new(&mut output)
                    .with_hook(&mut tracer)
                    .run_file(&target.script);
            })
            .unwrap();

        ThreadTracer {
            stop,
            handle: Some(handle),
        }
    }

    /// Supervisor whose "processes" are [`ThreadTracer`]s
    pub fn supervisor(&self) -> Supervisor {
        let respawn_target = self.clone();
        let checkpointer = MemoryCheckpointer::new(Box::new(move |id: i64| {
            Ok(Box::new(respawn_target.spawn(id)) as Box<dyn ChildProcess>)
        }));
        Supervisor::new(
            self.file.clone(),
            self.store.clone(),
            self.mailbox.clone(),
            Box::new(checkpointer),
            Box::new(ThreadLauncher(self.clone())),
        )
        .with_poll_interval(POLL)
    }
}

/// A tracer thread posing as a child process.
///
/// Its pid is the test process's, which is what the tracer reports in its
/// checkpoint requests.
pub struct ThreadTracer {
    stop: &'static AtomicBool,
    handle: Option<JoinHandle<()>>,
}

impl ChildProcess for ThreadTracer {
    fn pid(&self) -> u32 {
        std::process::id()
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        match &self.handle {
            Some(handle) if !handle.is_finished() => Ok(None),
            _ => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                Ok(Some(0))
            }
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

pub struct ThreadLauncher(pub TraceTarget);

impl Launcher for ThreadLauncher {
    fn launch(&mut self) -> io::Result<Box<dyn ChildProcess>> {
        Ok(Box::new(self.0.spawn(0)))
    }
}
