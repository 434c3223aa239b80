//! Errors raised while parsing or running a script

use std::fmt;
use std::path::Path;
use std::rc::Rc;

use thiserror::Error;

/// A parse-time failure.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message} (line {line})")]
pub struct SyntaxError {
    pub kind: &'static str,
    pub message: String,
    pub line: u32,
}

impl SyntaxError {
    pub fn new(kind: &'static str, message: impl Into<String>, line: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            line,
        }
    }
}

/// One frame of a traceback, pushed while an error unwinds.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub unit: Rc<Path>,
    pub line: u32,
    pub name: Rc<str>,
}

/// An exception raised by the running script.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: Rc<str>,
    pub message: String,
    /// Innermost frame first
    pub traceback: Vec<TraceEntry>,
    pub(crate) reported_in: Option<u64>,
}

impl RuntimeError {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: Rc::from(kind),
            message: message.into(),
            traceback: Vec::new(),
            reported_in: None,
        }
    }

    /// `"Kind: message"`, or just the kind when there is no message.
    pub fn summary(&self) -> String {
        if self.message.is_empty() {
            self.kind.to_string()
        } else {
            format!("{}: {}", self.kind, self.message)
        }
    }

    /// Render the traceback outermost frame first, using `source_line` to
    /// fetch the text of each referenced line.
    pub fn format_traceback(&self, source_line: impl Fn(&Path, u32) -> Option<String>) -> String {
        let mut out = String::from("Traceback (most recent call last):\n");
        for entry in self.traceback.iter().rev() {
            out.push_str(&format!(
                "  File \"{}\", line {}, in {}\n",
                entry.unit.display(),
                entry.line,
                entry.name
            ));
            if let Some(text) = source_line(&entry.unit, entry.line) {
                let text = text.trim();
                if !text.is_empty() {
                    out.push_str(&format!("    {text}\n"));
                }
            }
        }
        out
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    pub fn name_error(name: &str) -> Self {
        Self::new("NameError", format!("name '{name}' is not defined"))
    }

    pub fn zero_division(message: &str) -> Self {
        Self::new("ZeroDivisionError", message)
    }

    pub fn overflow() -> Self {
        Self::new("OverflowError", "integer overflow")
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

impl std::error::Error for RuntimeError {}

/// Why a trace hook stopped the script. Not catchable by `try`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Halt {
    /// Resume from the checkpoint taken at this sequence id
    Rewind(i64),
    /// The user interrupted the run
    Interrupted,
    /// The hook hit an unrecoverable error
    Failed(String),
}

/// What a script run ended with when it did not complete normally.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("{0}")]
    Syntax(SyntaxError),
    #[error("{}", .error.summary())]
    Runtime {
        error: RuntimeError,
        /// Formatted traceback including the final summary line
        rendered: String,
    },
    #[error("halted: {0:?}")]
    Halt(Halt),
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Non-local exit from statement execution.
#[derive(Debug)]
pub(crate) enum Unwind {
    Error(Box<RuntimeError>),
    Halt(Halt),
}

impl From<RuntimeError> for Unwind {
    fn from(err: RuntimeError) -> Self {
        Unwind::Error(Box::new(err))
    }
}

impl From<Halt> for Unwind {
    fn from(halt: Halt) -> Self {
        Unwind::Halt(halt)
    }
}
