use crate::interp::{Output, Stream};
use crate::mailbox::{Channel, Mailbox};
use crate::protocol::{OutputStream, ServerMessage};

/// Forwards the script's stdout and stderr to the relay instead of the
/// process's own streams.
#[derive(Debug, Clone)]
pub struct MailboxOutput {
    mailbox: Mailbox,
}

impl MailboxOutput {
    pub fn new(mailbox: Mailbox) -> Self {
        Self { mailbox }
    }

    fn send(&self, message: ServerMessage) {
        if let Err(e) = self.mailbox.append(Channel::AppToServer, &message) {
            tracing::warn!(error = %e, "Failed to forward script output");
        }
    }
}

impl Output for MailboxOutput {
    fn write(&mut self, stream: Stream, text: &str) {
        if text.is_empty() {
            return;
        }
        self.send(match stream {
            Stream::Stdout => ServerMessage::Stdout(text.to_string()),
            Stream::Stderr => ServerMessage::Stderr(text.to_string()),
        });
    }

    fn flush(&mut self, stream: Stream) {
        self.send(ServerMessage::Flush(match stream {
            Stream::Stdout => OutputStream::Stdout,
            Stream::Stderr => OutputStream::Stderr,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_output_becomes_typed_messages() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::new(dir.path());
        let mut output = MailboxOutput::new(mailbox.clone());

        output.write(Stream::Stdout, "hello\n");
        output.write(Stream::Stdout, "");
        output.flush(Stream::Stdout);
        output.write(Stream::Stderr, "oops\n");

        let messages: Vec<serde_json::Value> = mailbox.pop(Channel::AppToServer).unwrap();
        assert_eq!(
            messages,
            vec![
                json!({"type": "stdout", "data": "hello\n"}),
                json!({"type": "flush", "data": "stdout"}),
                json!({"type": "stderr", "data": "oops\n"}),
            ]
        );
    }
}
