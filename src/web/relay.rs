//! Per-connection bridge between a client and the traced process.
//!
//! Three duties run together on one connection:
//!
//! - inbound: client text goes onto `server→app`, and a watcher is started
//!   if none is running
//! - drain: `app→server` is forwarded to the client, headed by a `sync`
//!   whenever one is owed
//! - retry: messages queued by an earlier connection are resent, oldest first
//!
//! The relay ends as soon as any duty ends. A failed send ends it too, after
//! the unsent messages are queued on the session for the next connection.
//! Sends are serialized through one lock on the sink, and the retry queue is
//! only touched while holding it, so queued messages always go out before
//! newer ones.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::mailbox::{Channel, MailboxError};
use crate::protocol::ServerMessage;
use crate::supervisor::{Outbound, SessionManager, SupervisorError};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),
    #[error("Session error: {0}")]
    Session(#[from] SupervisorError),
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Send to client failed: {0}")]
    Send(String),
}

/// Serve one client until it disconnects or a duty fails.
pub async fn relay<S, R>(
    session: Arc<SessionManager>,
    sink: S,
    stream: R,
    poll_interval: Duration,
) -> Result<(), RelayError>
where
    S: Sink<String> + Unpin,
    S::Error: Display,
    R: Stream<Item = String> + Unpin,
{
    // a new connection is a reset for this client
    session.request_sync();
    let sink = Mutex::new(sink);

    tokio::select! {
        result = forward_inbound(&session, stream) => {
            tracing::debug!("Client stream ended");
            result
        }
        result = drain_outbound(&session, &sink, poll_interval) => result,
        result = retry_failed(&session, &sink, poll_interval) => result,
    }
}

async fn forward_inbound<R>(session: &SessionManager, mut stream: R) -> Result<(), RelayError>
where
    R: Stream<Item = String> + Unpin,
{
    while let Some(text) = stream.next().await {
        if session.mailbox().append_json(Channel::ServerToApp, &text)? {
            session.ensure_watcher_running().await?;
        }
    }
    Ok(())
}

async fn drain_outbound<S>(
    session: &SessionManager,
    sink: &Mutex<S>,
    poll_interval: Duration,
) -> Result<(), RelayError>
where
    S: Sink<String> + Unpin,
    S::Error: Display,
{
    loop {
        tokio::time::sleep(poll_interval).await;

        let mut batch = Vec::new();
        if session.take_sync() {
            match session.sync_payload() {
                Ok(payload) => {
                    session.drop_queued_syncs();
                    let text = serde_json::to_string(&ServerMessage::Sync(payload))?;
                    batch.push(Outbound::sync(text));
                }
                Err(e) if e.is_not_found() => {
                    tracing::debug!(error = %e, "Nothing to sync yet");
                    session.request_sync();
                }
                Err(e) => return Err(e.into()),
            }
        }
        batch.extend(
            session
                .mailbox()
                .pop_raw(Channel::AppToServer)?
                .into_iter()
                .map(Outbound::new),
        );
        if batch.is_empty() {
            continue;
        }

        let mut sink = sink.lock().await;
        if session.has_retries() {
            session.queue_retry(batch);
            continue;
        }
        if let Err((unsent, e)) = send_in_order(&mut *sink, batch).await {
            session.queue_retry(unsent);
            return Err(e);
        }
    }
}

async fn retry_failed<S>(
    session: &SessionManager,
    sink: &Mutex<S>,
    poll_interval: Duration,
) -> Result<(), RelayError>
where
    S: Sink<String> + Unpin,
    S::Error: Display,
{
    loop {
        tokio::time::sleep(poll_interval).await;

        let mut sink = sink.lock().await;
        let queued = session.take_retries();
        if queued.is_empty() {
            continue;
        }
        tracing::debug!(count = queued.len(), "Retrying queued messages");
        if let Err((unsent, e)) = send_in_order(&mut *sink, queued).await {
            session.requeue_front(unsent);
            return Err(e);
        }
    }
}

/// Send `batch` in order, stopping at the first failure. On failure returns
/// the failed message and everything after it.
async fn send_in_order<S>(
    sink: &mut S,
    batch: Vec<Outbound>,
) -> Result<(), (Vec<Outbound>, RelayError)>
where
    S: Sink<String> + Unpin,
    S::Error: Display,
{
    let mut pending = batch.into_iter();
    while let Some(message) = pending.next() {
        if let Err(e) = sink.send(message.text.clone()).await {
            tracing::debug!(error = %e, "Send failed, queueing for the next connection");
            let mut unsent = vec![message];
            unsent.extend(pending);
            return Err((unsent, RelayError::Send(e.to_string())));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::supervisor::{ChildProcess, Launcher};
    use crate::util::Paths;
    use futures::channel::mpsc;
    use serde_json::Value;
    use std::io;

    struct NoWatcher;

    impl Launcher for NoWatcher {
        fn launch(&mut self) -> io::Result<Box<dyn ChildProcess>> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "no watcher in tests"))
        }
    }

    fn session() -> (tempfile::TempDir, Arc<SessionManager>) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(Paths::new(dir.path()));
        let session = SessionManager::new(&config, Box::new(NoWatcher)).unwrap();
        (dir, Arc::new(session))
    }

    fn message_types(texts: &[String]) -> Vec<String> {
        texts
            .iter()
            .map(|text| {
                let value: Value = serde_json::from_str(text).unwrap();
                value["type"].as_str().unwrap().to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_invalid_inbound_json_is_dropped() {
        let (_dir, session) = session();
        let (out_tx, _out_rx) = mpsc::unbounded::<String>();
        let inbound = futures::stream::iter(vec![
            "not json".to_string(),
            "{\"type\":  \"continue\"}".to_string(),
        ]);

        relay(session.clone(), out_tx, inbound, Duration::from_millis(5))
            .await
            .unwrap();

        let forwarded = session.mailbox().read_raw(Channel::ServerToApp).unwrap();
        assert_eq!(forwarded, vec!["{\"type\":\"continue\"}".to_string()]);
    }

    #[tokio::test]
    async fn test_outbound_messages_are_forwarded_in_order() {
        let (_dir, session) = session();
        for text in ["a", "b"] {
            session
                .mailbox()
                .append(Channel::AppToServer, &ServerMessage::Stdout(text.into()))
                .unwrap();
        }
        let (out_tx, mut out_rx) = mpsc::unbounded::<String>();
        let (_in_tx, in_rx) = mpsc::unbounded::<String>();

        let task = tokio::spawn(relay(session.clone(), out_tx, in_rx, Duration::from_millis(5)));
        let first = out_rx.next().await.unwrap();
        let second = out_rx.next().await.unwrap();
        task.abort();

        assert_eq!(first, "{\"type\":\"stdout\",\"data\":\"a\"}");
        assert_eq!(second, "{\"type\":\"stdout\",\"data\":\"b\"}");
    }

    /// Sink that fails every send while `down` is set.
    struct Flaky {
        down: Arc<std::sync::atomic::AtomicBool>,
        sent: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    impl Sink<String> for Flaky {
        type Error = &'static str;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn start_send(self: std::pin::Pin<&mut Self>, item: String) -> Result<(), Self::Error> {
            if self.down.load(std::sync::atomic::Ordering::SeqCst) {
                return Err("connection down");
            }
            self.sent.lock().push(item);
            Ok(())
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_failed_send_ends_the_connection_and_keeps_the_message() {
        let (_dir, session) = session();
        let down = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let sent = Arc::new(parking_lot::Mutex::new(Vec::new()));
        session
            .mailbox()
            .append(Channel::AppToServer, &ServerMessage::Stdout("1".into()))
            .unwrap();

        let (_in_tx, in_rx) = mpsc::unbounded::<String>();
        let sink = Flaky {
            down: down.clone(),
            sent: sent.clone(),
        };
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            relay(session.clone(), sink, in_rx, Duration::from_millis(5)),
        )
        .await
        .expect("relay kept running after a failed send");
        assert!(matches!(result, Err(RelayError::Send(_))));
        assert!(session.has_retries());

        // the next connection gets the kept message before newer ones
        session
            .mailbox()
            .append(Channel::AppToServer, &ServerMessage::Stdout("2".into()))
            .unwrap();
        down.store(false, std::sync::atomic::Ordering::SeqCst);
        let (_in_tx, in_rx) = mpsc::unbounded::<String>();
        let sink = Flaky {
            down: down.clone(),
            sent: sent.clone(),
        };
        let task = tokio::spawn(relay(session.clone(), sink, in_rx, Duration::from_millis(5)));
        while sent.lock().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        task.abort();

        let sent = sent.lock().clone();
        assert_eq!(message_types(&sent), vec!["stdout", "stdout"]);
        assert!(sent[0].contains("\"1\""));
        assert!(sent[1].contains("\"2\""));
        assert!(!session.has_retries());
    }
}
