//! Records persisted in the timeline store

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::scope::ScopeDiff;

/// What kind of interpreter event a timeline record describes.
///
/// Return values and exception details ride on the variant that produces
/// them instead of being optional columns on every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EventKind {
    Call,
    Line,
    Return {
        return_value: Value,
    },
    Exception {
        /// `"Type: message"`
        error: String,
        /// Formatted traceback, outermost frame first
        traceback: String,
    },
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Call => "call",
            EventKind::Line => "line",
            EventKind::Return { .. } => "return",
            EventKind::Exception { .. } => "exception",
        }
    }
}

/// One recorded interpreter event of the active target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Canonical path of the traced target
    #[serde(rename = "file")]
    pub target_file: String,
    /// Position on the target's timeline, starting at 1
    #[serde(rename = "id")]
    pub sequence_id: i64,
    #[serde(flatten)]
    pub kind: EventKind,
    /// Enclosing function name, or the unit's file name for module scope
    #[serde(rename = "target")]
    pub target_name: String,
    /// File name of the source unit the event happened in
    pub unit: String,
    pub frame_id: u64,
    pub function: Option<String>,
    pub line_number: u32,
    #[serde(rename = "source_segment")]
    pub source_text: String,
    pub global_diff: ScopeDiff,
    pub local_diff: ScopeDiff,
}

/// Per-target resumption anchor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPointer {
    /// Timeline cursor (`None` when no rewindable session is active)
    pub last_sequence_id: Option<i64>,
    /// Node cursor
    pub last_line_number: Option<u32>,
}

impl SessionPointer {
    pub fn new(last_sequence_id: Option<i64>, last_line_number: Option<u32>) -> Self {
        Self {
            last_sequence_id,
            last_line_number,
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.last_sequence_id.is_none()
    }
}
