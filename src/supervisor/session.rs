//! Server-side ownership of the active target and its watcher

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;

use super::process::{shutdown_gracefully, ChildProcess, CommandLauncher, Launcher};
use super::{newest_rewind_id, SupervisorError};
use crate::config::Config;
use crate::data::{Database, DatabaseError, TimelineStore};
use crate::mailbox::{Channel, Mailbox};
use crate::protocol::SyncPayload;
use crate::util::Paths;
use crate::web::layout;

/// One serialized outbound message waiting to reach the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub is_sync: bool,
    pub text: String,
}

impl Outbound {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            is_sync: false,
            text: text.into(),
        }
    }

    pub fn sync(text: impl Into<String>) -> Self {
        Self {
            is_sync: true,
            text: text.into(),
        }
    }
}

/// Holds the active target, the watcher handle and the client retry queue.
///
/// Constructed once per server and shared by every request and relay.
pub struct SessionManager {
    store: TimelineStore,
    mailbox: Mailbox,
    paths: Paths,
    target_name: String,
    shutdown_grace: Duration,
    launcher: parking_lot::Mutex<Box<dyn Launcher>>,
    watcher: tokio::sync::Mutex<Option<Box<dyn ChildProcess>>>,
    needs_sync: AtomicBool,
    retries: parking_lot::Mutex<VecDeque<Outbound>>,
}

impl SessionManager {
    pub fn new(config: &Config, launcher: Box<dyn Launcher>) -> Result<Self, SupervisorError> {
        let paths = config.paths.clone();
        let store = TimelineStore::new(Database::open(paths.database())?);
        Ok(Self {
            store,
            mailbox: Mailbox::new(paths.mailbox_dir()),
            paths,
            target_name: config.session.target_name.clone(),
            shutdown_grace: config.session.shutdown_grace,
            launcher: parking_lot::Mutex::new(launcher),
            watcher: tokio::sync::Mutex::new(None),
            needs_sync: AtomicBool::new(false),
            retries: parking_lot::Mutex::new(VecDeque::new()),
        })
    }

    /// Manager whose watcher is `rewind watch` run from this executable.
    pub fn from_config(config: &Config) -> Result<Self, SupervisorError> {
        let launcher = CommandLauncher::current_exe(
            &config.watcher_command_prefix,
            [
                "--data-dir".into(),
                config.paths.data_dir().as_os_str().to_owned(),
                "watch".into(),
            ],
        )
        .map_err(SupervisorError::Spawn)?;
        Self::new(config, Box::new(launcher))
    }

    pub fn store(&self) -> &TimelineStore {
        &self.store
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Replace the active target and start a fresh watcher for it.
    ///
    /// The old watcher is stopped before anything about the new target is
    /// written, so no row of the new timeline can come from the old child.
    pub async fn upload(&self, source: &[u8]) -> Result<PathBuf, SupervisorError> {
        let mut watcher = self.watcher.lock().await;
        if let Some(mut child) = watcher.take() {
            tracing::info!(pid = child.pid(), "Stopping watcher for new upload");
            shutdown_gracefully(child.as_mut(), self.shutdown_grace)
                .await
                .map_err(SupervisorError::Child)?;
        }

        let path = self.paths.target_script(&self.target_name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| io_error(parent, source))?;
        }
        tokio::fs::write(&path, source)
            .await
            .map_err(|e| io_error(&path, e))?;
        let path = tokio::fs::canonicalize(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        let file = path.to_string_lossy().into_owned();

        self.mailbox.clear_all()?;
        self.store.register_target(&file)?;
        self.store.set_active_target(&file)?;
        self.retries.lock().clear();
        self.request_sync();
        tracing::info!(target = %file, bytes = source.len(), "Target uploaded");

        *watcher = Some(self.launch_watcher()?);
        Ok(path)
    }

    /// Respawn the watcher if it is not running.
    ///
    /// When the active target has a stored pointer, the new watcher is told
    /// to resume from it instead of starting the script over.
    pub async fn ensure_watcher_running(&self) -> Result<(), SupervisorError> {
        let mut watcher = self.watcher.lock().await;
        if let Some(child) = watcher.as_mut() {
            match child.try_wait().map_err(SupervisorError::Child)? {
                None => return Ok(()),
                Some(code) => tracing::info!(pid = child.pid(), code, "Watcher exited"),
            }
        }
        *watcher = None;

        let target = match self.store.get_active_target() {
            Ok(target) => target,
            Err(DatabaseError::NotFound(_)) => {
                tracing::debug!("No active target, not starting a watcher");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match self.store.get_pointer(&target) {
            Ok(pointer) => {
                if let Some(sequence_id) = pointer.last_sequence_id {
                    let entries: Vec<Value> = self.mailbox.read(Channel::Watcher)?;
                    if newest_rewind_id(&entries) != Some(sequence_id) {
                        self.mailbox.append(Channel::Watcher, &sequence_id)?;
                    }
                    tracing::info!(sequence_id, "Watcher will resume from stored pointer");
                }
            }
            Err(e) => tracing::warn!(target = %target, error = %e, "Stored pointer is unusable"),
        }

        *watcher = Some(self.launch_watcher()?);
        Ok(())
    }

    fn launch_watcher(&self) -> Result<Box<dyn ChildProcess>, SupervisorError> {
        let child = self.launcher.lock().launch().map_err(SupervisorError::Spawn)?;
        tracing::info!(pid = child.pid(), "Watcher started");
        Ok(child)
    }

    /// Pid of the current watcher, if one has been started
    pub async fn watcher_pid(&self) -> Option<u32> {
        self.watcher.lock().await.as_ref().map(|child| child.pid())
    }

    /// Stop the watcher, if any. Called once on server shutdown.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        if let Some(mut child) = self.watcher.lock().await.take() {
            shutdown_gracefully(child.as_mut(), self.shutdown_grace)
                .await
                .map_err(SupervisorError::Child)?;
        }
        Ok(())
    }

    /// Everything a client needs to rebuild its view.
    pub fn sync_payload(&self) -> Result<SyncPayload, SupervisorError> {
        let target = self.store.get_active_target()?;
        let (pointer, timeline) = self.store.timeline(&target)?;
        let source =
            std::fs::read_to_string(&target).map_err(|e| io_error(Path::new(&target), e))?;
        let unit = Path::new(&target)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(SyncPayload {
            nodes: layout::nodes(&source, &unit, &timeline),
            node_id: pointer.last_line_number.map(|line| line.to_string()),
            timeline,
            timeline_id: pointer.last_sequence_id,
        })
    }

    /// Owe every client a fresh `sync`. Older queued syncs are stale now.
    pub fn request_sync(&self) {
        self.needs_sync.store(true, Ordering::SeqCst);
        self.drop_queued_syncs();
    }

    /// Claim the owed `sync`, if any.
    pub fn take_sync(&self) -> bool {
        self.needs_sync.swap(false, Ordering::SeqCst)
    }

    pub fn drop_queued_syncs(&self) {
        self.retries.lock().retain(|message| !message.is_sync);
    }

    pub fn queue_retry(&self, messages: impl IntoIterator<Item = Outbound>) {
        self.retries.lock().extend(messages);
    }

    /// Put messages back ahead of everything queued
    pub fn requeue_front(&self, messages: Vec<Outbound>) {
        let mut retries = self.retries.lock();
        for message in messages.into_iter().rev() {
            retries.push_front(message);
        }
    }

    pub fn take_retries(&self) -> Vec<Outbound> {
        self.retries.lock().drain(..).collect()
    }

    pub fn has_retries(&self) -> bool {
        !self.retries.lock().is_empty()
    }
}

fn io_error(path: &Path, source: io::Error) -> SupervisorError {
    SupervisorError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{EventKind, TimelineEvent};
    use crate::scope::ScopeDiff;
    use std::sync::Arc;

    struct Idle {
        pid: u32,
        stopped: Arc<AtomicBool>,
    }

    impl ChildProcess for Idle {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn try_wait(&mut self) -> io::Result<Option<i32>> {
            Ok(self.stopped.load(Ordering::SeqCst).then_some(0))
        }

        fn kill(&mut self) -> io::Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default, Clone)]
    struct Spawner {
        stops: Arc<parking_lot::Mutex<Vec<Arc<AtomicBool>>>>,
    }

    impl Launcher for Spawner {
        fn launch(&mut self) -> io::Result<Box<dyn ChildProcess>> {
            let stopped = Arc::new(AtomicBool::new(false));
            let mut stops = self.stops.lock();
            stops.push(stopped.clone());
            Ok(Box::new(Idle {
                pid: 10 + stops.len() as u32,
                stopped,
            }))
        }
    }

    fn manager() -> (tempfile::TempDir, Spawner, SessionManager) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(Paths::new(dir.path()));
        let spawner = Spawner::default();
        let manager = SessionManager::new(&config, Box::new(spawner.clone())).unwrap();
        (dir, spawner, manager)
    }

    fn line_event(file: &str, id: i64, line: u32) -> TimelineEvent {
        TimelineEvent {
            target_file: file.into(),
            sequence_id: id,
            kind: EventKind::Line,
            target_name: "<module>".into(),
            unit: "main.py".into(),
            frame_id: 1,
            function: None,
            line_number: line,
            source_text: String::new(),
            global_diff: ScopeDiff::new(),
            local_diff: ScopeDiff::new(),
        }
    }

    #[tokio::test]
    async fn test_sync_without_target_is_not_found() {
        let (_dir, _spawner, manager) = manager();
        let err = manager.sync_payload().unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_upload_replaces_watcher_and_timeline() {
        let (_dir, spawner, manager) = manager();
        let path = manager.upload(b"x = 1\ny = 2\n").await.unwrap();
        let file = path.to_string_lossy().into_owned();
        assert_eq!(manager.watcher_pid().await, Some(11));
        assert!(manager.take_sync());

        manager.store().record(&line_event(&file, 1, 1)).unwrap();
        manager
            .mailbox()
            .append(Channel::AppToServer, &"stale")
            .unwrap();

        manager.upload(b"print('again')\n").await.unwrap();
        assert!(spawner.stops.lock()[0].load(Ordering::SeqCst));
        assert_eq!(manager.watcher_pid().await, Some(12));
        assert!(manager.mailbox().read_raw(Channel::AppToServer).unwrap().is_empty());

        let sync = manager.sync_payload().unwrap();
        assert!(sync.timeline.is_empty());
        assert_eq!(sync.timeline_id, None);
        assert_eq!(sync.node_id, None);
        assert_eq!(sync.nodes.len(), 1);
        assert_eq!(sync.nodes[0].data.source_segment, "print('again')");
    }

    #[tokio::test]
    async fn test_respawned_watcher_resumes_from_pointer() {
        let (_dir, spawner, manager) = manager();
        let path = manager.upload(b"x = 1\n").await.unwrap();
        let file = path.to_string_lossy().into_owned();
        manager.store().record(&line_event(&file, 1, 1)).unwrap();

        // still running: nothing to do
        manager.ensure_watcher_running().await.unwrap();
        assert_eq!(spawner.stops.lock().len(), 1);

        spawner.stops.lock()[0].store(true, Ordering::SeqCst);
        manager.ensure_watcher_running().await.unwrap();
        manager.ensure_watcher_running().await.unwrap();

        assert_eq!(spawner.stops.lock().len(), 2);
        let entries: Vec<Value> = manager.mailbox().read(Channel::Watcher).unwrap();
        assert_eq!(entries, vec![serde_json::json!(1)]);
    }

    #[tokio::test]
    async fn test_sync_reports_cursor() {
        let (_dir, _spawner, manager) = manager();
        let path = manager.upload(b"a = 1\n\nb = 2\n").await.unwrap();
        let file = path.to_string_lossy().into_owned();
        manager.store().record(&line_event(&file, 1, 1)).unwrap();
        manager.store().record(&line_event(&file, 2, 3)).unwrap();

        let sync = manager.sync_payload().unwrap();
        assert_eq!(sync.timeline.len(), 2);
        assert_eq!(sync.timeline_id, Some(2));
        assert_eq!(sync.node_id.as_deref(), Some("3"));
        assert_eq!(sync.nodes[1].id, "3");
        assert_eq!(sync.nodes[1].data.frame_pointer, Some(1));
    }

    #[test]
    fn test_request_sync_drops_queued_syncs() {
        let (_dir, _spawner, manager) = manager();
        manager.queue_retry([Outbound::sync("old"), Outbound::new("a")]);
        manager.request_sync();
        manager.requeue_front(vec![Outbound::new("first")]);

        assert!(manager.take_sync());
        assert!(!manager.take_sync());
        assert_eq!(
            manager.take_retries(),
            vec![Outbound::new("first"), Outbound::new("a")]
        );
        assert!(!manager.has_retries());
    }
}
