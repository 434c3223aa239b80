//! Durable, lock-guarded, file-backed message channels.
//!
//! Each channel is a JSON-lines file. Every operation holds an exclusive
//! `flock` on the file for its whole duration, so concurrent producers and
//! consumers in different processes never observe a torn write or lose a
//! line. Lines that fail to parse are skipped on read.

mod lock;

use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use lock::LockedFile;

/// Named channels shared by the server, the watcher and the traced child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Client commands into the traced process
    ServerToApp,
    /// Events, stdout and stderr out of the traced process
    AppToServer,
    /// Rewind target ids between tracer, server and supervisor
    Watcher,
    /// Snapshot requests from the tracer to the supervisor
    CheckpointRequests,
    /// Snapshot acknowledgements from the supervisor to the tracer
    CheckpointAcks,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::ServerToApp,
        Channel::AppToServer,
        Channel::Watcher,
        Channel::CheckpointRequests,
        Channel::CheckpointAcks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::ServerToApp => "server_to_app",
            Channel::AppToServer => "app_to_server",
            Channel::Watcher => "watcher",
            Channel::CheckpointRequests => "checkpoint_requests",
            Channel::CheckpointAcks => "checkpoint_acks",
        }
    }

    fn file_name(&self) -> String {
        format!("_{}.txt", self.as_str())
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum MailboxError {
    #[error("I/O error on channel {channel}: {source}")]
    Io {
        channel: Channel,
        #[source]
        source: io::Error,
    },
    #[error("Failed to serialize message for channel {channel}: {source}")]
    Serialize {
        channel: Channel,
        #[source]
        source: serde_json::Error,
    },
}

/// Handle to the directory holding every channel file.
#[derive(Debug, Clone)]
pub struct Mailbox {
    dir: PathBuf,
}

impl Mailbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Backing file of a channel
    pub fn path(&self, channel: Channel) -> PathBuf {
        self.dir.join(channel.file_name())
    }

    /// Append one message to the end of a channel
    pub fn append<T: Serialize>(&self, channel: Channel, message: &T) -> Result<(), MailboxError> {
        let line = encode(channel, message)?;
        self.with_lock(channel, |file| {
            file.seek(SeekFrom::End(0))?;
            write_lines(file, std::slice::from_ref(&line))
        })
    }

    /// Append a raw JSON document, re-encoded onto a single line.
    ///
    /// Returns `false` (and appends nothing) when the text is not valid JSON.
    pub fn append_json(&self, channel: Channel, text: &str) -> Result<bool, MailboxError> {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => {
                self.append(channel, &value)?;
                Ok(true)
            }
            Err(e) => {
                tracing::debug!(%channel, error = %e, "Dropping malformed JSON message");
                Ok(false)
            }
        }
    }

    /// Replace the whole contents of a channel
    pub fn replace<T: Serialize>(
        &self,
        channel: Channel,
        messages: &[T],
    ) -> Result<(), MailboxError> {
        let lines = messages
            .iter()
            .map(|m| encode(channel, m))
            .collect::<Result<Vec<_>, _>>()?;
        self.with_lock(channel, |file| {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            write_lines(file, &lines)
        })
    }

    /// Put messages back at the head of a channel, ahead of anything appended since
    pub fn requeue<T: Serialize>(
        &self,
        channel: Channel,
        messages: &[T],
    ) -> Result<(), MailboxError> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut lines = messages
            .iter()
            .map(|m| encode(channel, m))
            .collect::<Result<Vec<_>, _>>()?;
        self.with_lock(channel, |file| {
            let existing = read_all(file)?;
            lines.extend(existing.lines().map(str::to_string));
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            write_lines(file, &lines)
        })
    }

    /// Atomically drain a channel, returning every parseable message
    pub fn pop<T: DeserializeOwned>(&self, channel: Channel) -> Result<Vec<T>, MailboxError> {
        let text = self.drain(channel)?;
        Ok(parse_lines(channel, &text))
    }

    /// Atomically drain a channel, keeping each valid JSON line as text
    pub fn pop_raw(&self, channel: Channel) -> Result<Vec<String>, MailboxError> {
        let text = self.drain(channel)?;
        Ok(valid_lines(channel, &text))
    }

    /// Read a channel without clearing it
    pub fn read<T: DeserializeOwned>(&self, channel: Channel) -> Result<Vec<T>, MailboxError> {
        let text = self.with_lock(channel, |file| read_all(file))?;
        Ok(parse_lines(channel, &text))
    }

    /// Read a channel without clearing it, keeping each valid JSON line as text
    pub fn read_raw(&self, channel: Channel) -> Result<Vec<String>, MailboxError> {
        let text = self.with_lock(channel, |file| read_all(file))?;
        Ok(valid_lines(channel, &text))
    }

    /// Empty a channel
    pub fn clear(&self, channel: Channel) -> Result<(), MailboxError> {
        self.drain(channel).map(|_| ())
    }

    /// Empty every channel
    pub fn clear_all(&self) -> Result<(), MailboxError> {
        for channel in Channel::ALL {
            self.clear(channel)?;
        }
        Ok(())
    }

    fn drain(&self, channel: Channel) -> Result<String, MailboxError> {
        self.with_lock(channel, |file| {
            let text = read_all(file)?;
            if !text.is_empty() {
                file.set_len(0)?;
                file.sync_data()?;
            }
            Ok(text)
        })
    }

    fn with_lock<T>(
        &self,
        channel: Channel,
        f: impl FnOnce(&mut std::fs::File) -> io::Result<T>,
    ) -> Result<T, MailboxError> {
        let io_err = |source| MailboxError::Io { channel, source };
        let path = self.path(channel);
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);

        let mut locked = match LockedFile::open(&path, &options) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                std::fs::create_dir_all(&self.dir).map_err(io_err)?;
                LockedFile::open(&path, &options).map_err(io_err)?
            }
            other => other.map_err(io_err)?,
        };
        f(locked.file_mut()).map_err(io_err)
    }
}

fn encode<T: Serialize>(channel: Channel, message: &T) -> Result<String, MailboxError> {
    serde_json::to_string(message).map_err(|source| MailboxError::Serialize { channel, source })
}

fn read_all(file: &mut std::fs::File) -> io::Result<String> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut text)?;
    Ok(text)
}

fn write_lines(file: &mut std::fs::File, lines: &[String]) -> io::Result<()> {
    let mut buf = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
    for line in lines {
        buf.push_str(line);
        buf.push('\n');
    }
    file.write_all(buf.as_bytes())?;
    file.flush()?;
    file.sync_data()
}

fn parse_lines<T: DeserializeOwned>(channel: Channel, text: &str) -> Vec<T> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::debug!(%channel, error = %e, "Skipping malformed mailbox line");
                None
            }
        })
        .collect()
}

fn valid_lines(channel: Channel, text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| {
            let ok = serde_json::from_str::<serde::de::IgnoredAny>(line).is_ok();
            if !ok {
                tracing::debug!(%channel, "Skipping malformed mailbox line");
            }
            ok
        })
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Note {
        producer: usize,
        seq: usize,
    }

    #[test]
    fn test_append_then_pop_drains() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::new(dir.path().join("mailbox"));

        mailbox.append(Channel::Watcher, &3).unwrap();
        mailbox.append(Channel::Watcher, &7).unwrap();

        let ids: Vec<i64> = mailbox.pop(Channel::Watcher).unwrap();
        assert_eq!(ids, vec![3, 7]);
        assert!(mailbox.pop::<i64>(Channel::Watcher).unwrap().is_empty());
    }

    #[test]
    fn test_read_does_not_clear() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::new(dir.path());

        mailbox.append(Channel::Watcher, &"5").unwrap();
        assert_eq!(mailbox.read::<String>(Channel::Watcher).unwrap(), vec!["5"]);
        assert_eq!(mailbox.read::<String>(Channel::Watcher).unwrap(), vec!["5"]);
    }

    #[test]
    fn test_replace_overwrites() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::new(dir.path());

        mailbox.append(Channel::Watcher, &1).unwrap();
        mailbox.append(Channel::Watcher, &2).unwrap();
        mailbox.replace(Channel::Watcher, &[9]).unwrap();
        assert_eq!(mailbox.pop::<i64>(Channel::Watcher).unwrap(), vec![9]);
    }

    #[test]
    fn test_requeue_puts_messages_first() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::new(dir.path());

        mailbox.append(Channel::ServerToApp, &"later").unwrap();
        mailbox
            .requeue(Channel::ServerToApp, &["first", "second"])
            .unwrap();
        assert_eq!(
            mailbox.pop::<String>(Channel::ServerToApp).unwrap(),
            vec!["first", "second", "later"]
        );
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::new(dir.path());
        let path = mailbox.path(Channel::AppToServer);
        std::fs::write(&path, "{\"a\":1}\nnot json\n\n{\"a\":2}\n{\"a\":\n").unwrap();

        let raw = mailbox.read_raw(Channel::AppToServer).unwrap();
        assert_eq!(raw, vec!["{\"a\":1}", "{\"a\":2}"]);

        let values: Vec<serde_json::Value> = mailbox.pop(Channel::AppToServer).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_append_json_rejects_invalid_text() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::new(dir.path());

        assert!(!mailbox.append_json(Channel::ServerToApp, "{oops").unwrap());
        assert!(mailbox
            .append_json(Channel::ServerToApp, "{\n  \"type\": \"continue\"\n}")
            .unwrap());
        assert_eq!(
            mailbox.pop_raw(Channel::ServerToApp).unwrap(),
            vec!["{\"type\":\"continue\"}"]
        );
    }

    #[test]
    fn test_concurrent_producers_keep_local_order() {
        let dir = tempdir().unwrap();
        let mailbox = Arc::new(Mailbox::new(dir.path()));
        let producers = 8;
        let per_producer = 25;

        let handles: Vec<_> = (0..producers)
            .map(|producer| {
                let mailbox = Arc::clone(&mailbox);
                std::thread::spawn(move || {
                    for seq in 0..per_producer {
                        mailbox
                            .append(Channel::AppToServer, &Note { producer, seq })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let notes: Vec<Note> = mailbox.pop(Channel::AppToServer).unwrap();
        assert_eq!(notes.len(), producers * per_producer);

        for producer in 0..producers {
            let seqs: Vec<usize> = notes
                .iter()
                .filter(|n| n.producer == producer)
                .map(|n| n.seq)
                .collect();
            assert_eq!(seqs, (0..per_producer).collect::<Vec<_>>());
        }
    }
}
