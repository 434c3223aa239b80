//! Messages exchanged between the client, the relay, the tracer and the watcher

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::TimelineEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Outbound envelope: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ServerMessage {
    Sync(SyncPayload),
    Event(TimelineEvent),
    Stdout(String),
    Stderr(String),
    Flush(OutputStream),
}

/// Full state handed to a client after a reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub nodes: Vec<Node>,
    /// Node under the cursor
    pub node_id: Option<String>,
    pub timeline: Vec<TimelineEvent>,
    /// Timeline cursor
    pub timeline_id: Option<i64>,
}

/// One source line laid out for the client's canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub position: Position,
    pub data: NodeData,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Quarter of the indent width per leading space, so fractional
    pub x: f64,
    pub y: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    pub source_segment: String,
    /// Frame of the last recorded event on this line, up to the cursor
    #[serde(rename = "framePointer")]
    pub frame_pointer: Option<u64>,
}

/// Tracer to watcher: snapshot this process before event `sequence_id` is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRequest {
    pub sequence_id: i64,
    pub pid: u32,
}

/// Watcher to tracer: outcome of a [`CheckpointRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointAck {
    pub sequence_id: i64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckpointAck {
    pub fn ok(sequence_id: i64) -> Self {
        Self {
            sequence_id,
            ok: true,
            error: None,
        }
    }

    pub fn failed(sequence_id: i64, error: impl Into<String>) -> Self {
        Self {
            sequence_id,
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// A recognized inbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Continue,
    /// Resume from the checkpoint taken at this sequence id
    Rewind(i64),
    UpdateNodeCode { lineno: Value, code_segment: String },
    Stdin(StdinInput),
}

/// What a `stdin` command asks of the current frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StdinInput {
    Jump(i64),
    Assign { name: String, value: Value },
    Invalid(String),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Envelope {
    Continue,
    NewTimelineId {
        new_timeline_id: Value,
    },
    UpdateNodeCode {
        #[serde(default)]
        lineno: Value,
        #[serde(default)]
        code_segment: String,
    },
    Stdin {
        #[serde(default)]
        data: Value,
    },
}

impl ClientCommand {
    /// Interpret one inbound JSON message. Unknown or malformed commands
    /// yield `None`.
    pub fn parse(raw: &Value) -> Option<Self> {
        match raw {
            Value::String(text) if text.trim() == "continue" => Some(ClientCommand::Continue),
            Value::Number(_) | Value::String(_) => sequence_id(raw).map(ClientCommand::Rewind),
            Value::Object(_) => match Envelope::deserialize(raw).ok()? {
                Envelope::Continue => Some(ClientCommand::Continue),
                Envelope::NewTimelineId { new_timeline_id } => {
                    sequence_id(&new_timeline_id).map(ClientCommand::Rewind)
                }
                Envelope::UpdateNodeCode {
                    lineno,
                    code_segment,
                } => Some(ClientCommand::UpdateNodeCode {
                    lineno,
                    code_segment,
                }),
                Envelope::Stdin { data } => Some(ClientCommand::Stdin(StdinInput::parse(&data))),
            },
            _ => None,
        }
    }
}

impl StdinInput {
    /// An integer is a line to jump to; `name = <json>` rebinds a local.
    pub fn parse(data: &Value) -> Self {
        match data {
            Value::Number(n) => match n.as_i64() {
                Some(line) => StdinInput::Jump(line),
                None => StdinInput::Invalid(n.to_string()),
            },
            Value::String(text) => {
                let text = text.trim();
                if let Ok(line) = text.parse::<i64>() {
                    return StdinInput::Jump(line);
                }
                if let Some((name, literal)) = text.split_once('=') {
                    let name = name.trim();
                    if is_identifier(name) {
                        if let Ok(value) = serde_json::from_str(literal.trim()) {
                            return StdinInput::Assign {
                                name: name.to_string(),
                                value,
                            };
                        }
                    }
                }
                StdinInput::Invalid(text.to_string())
            }
            other => StdinInput::Invalid(other.to_string()),
        }
    }
}

fn sequence_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}
