//! Integration tests for uploads, sync and client reconnects

use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::StreamExt;
use rewind::config::Config;
use rewind::mailbox::Channel;
use rewind::protocol::ServerMessage;
use rewind::supervisor::CommandLauncher;
use rewind::web::{relay, RelayError};
use rewind::{Paths, SessionManager};
use serde_json::Value;
use tempfile::TempDir;

fn session_with(dir: &TempDir, watcher: CommandLauncher) -> Arc<SessionManager> {
    let mut config = Config::new(Paths::new(dir.path()));
    config.session.shutdown_grace = Duration::from_millis(500);
    Arc::new(SessionManager::new(&config, Box::new(watcher)).unwrap())
}

#[cfg(unix)]
fn alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Uploading a new target stops the old watcher before the new target exists
#[cfg(unix)]
#[tokio::test]
async fn test_upload_terminates_previous_watcher() {
    let dir = TempDir::new().unwrap();
    let session = session_with(&dir, CommandLauncher::new("sleep", ["30"]));

    session.upload(b"x = 1\n").await.unwrap();
    let first = session.watcher_pid().await.unwrap();
    assert!(alive(first));

    session.upload(b"y = 2\nprint(y)\n").await.unwrap();
    let second = session.watcher_pid().await.unwrap();
    assert_ne!(first, second);
    assert!(!alive(first), "old watcher {first} still running");

    let sync = session.sync_payload().unwrap();
    assert!(sync.timeline.is_empty());
    assert_eq!(sync.timeline_id, None);
    assert_eq!(sync.nodes.len(), 2);

    session.shutdown().await.unwrap();
    assert!(!alive(second));
}

fn count_syncs(texts: &[String]) -> usize {
    texts
        .iter()
        .filter(|text| {
            serde_json::from_str::<Value>(text).unwrap()["type"] == "sync"
        })
        .count()
}

/// A client that drops mid-send gets exactly one sync when it comes back
#[cfg(unix)]
#[tokio::test]
async fn test_reconnect_receives_exactly_one_sync() {
    let dir = TempDir::new().unwrap();
    let session = session_with(&dir, CommandLauncher::new("true", Vec::<String>::new()));
    session.upload(b"a = 1\nb = 2\n").await.unwrap();
    session
        .mailbox()
        .append(Channel::AppToServer, &ServerMessage::Stdout("early\n".into()))
        .unwrap();

    // first connection: the client is already gone, so the first send fails
    let (dead_tx, dead_rx) = mpsc::unbounded::<String>();
    drop(dead_rx);
    let (_in_tx, in_rx) = mpsc::unbounded::<String>();
    let first = tokio::time::timeout(
        Duration::from_secs(5),
        relay(session.clone(), dead_tx, in_rx, Duration::from_millis(5)),
    )
    .await
    .expect("relay kept running after a failed send");
    assert!(matches!(first, Err(RelayError::Send(_))));
    assert!(session.has_retries());

    // second connection
    let (out_tx, mut out_rx) = mpsc::unbounded::<String>();
    let (_in_tx, in_rx) = mpsc::unbounded::<String>();
    let second = tokio::spawn(relay(session.clone(), out_tx, in_rx, Duration::from_millis(5)));

    let mut received = Vec::new();
    let _ = tokio::time::timeout(Duration::from_millis(400), async {
        while let Some(text) = out_rx.next().await {
            received.push(text);
        }
    })
    .await;
    second.abort();

    assert_eq!(count_syncs(&received), 1, "received: {received:?}");
    assert!(received.iter().any(|text| text.contains("early")));
    let sync: Value = received
        .iter()
        .map(|text| serde_json::from_str::<Value>(text).unwrap())
        .find(|value| value["type"] == "sync")
        .unwrap();
    assert_eq!(sync["data"]["nodes"].as_array().unwrap().len(), 2);
    assert_eq!(sync["data"]["timeline_id"], Value::Null);
}
