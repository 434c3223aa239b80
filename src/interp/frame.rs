//! Activation records and the hook interface exposed to tracers

use std::cell::RefCell;
use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::rc::Rc;

use thiserror::Error;

use super::ast::Block;
use super::error::{Halt, RuntimeError};
use super::value::{Scope, Value};
use crate::scope::ScopeSnapshot;

#[derive(Debug)]
pub struct Frame {
    pub(crate) id: u64,
    pub(crate) back: Option<u64>,
    pub(crate) code_name: Rc<str>,
    pub(crate) unit: Rc<Path>,
    pub(crate) line: u32,
    pub(crate) globals: Scope,
    /// `None` for module frames, whose locals are their globals
    pub(crate) locals: Option<Scope>,
    pub(crate) global_names: HashSet<String>,
    /// Statement lists currently executing, innermost last
    pub(crate) blocks: Vec<Block>,
    pub(crate) jump: Option<u32>,
    pub(crate) handling: Option<Box<RuntimeError>>,
}

impl Frame {
    pub(crate) fn new(
        id: u64,
        back: Option<u64>,
        code_name: Rc<str>,
        unit: Rc<Path>,
        line: u32,
        globals: Scope,
        locals: Option<Scope>,
    ) -> Self {
        Self {
            id,
            back,
            code_name,
            unit,
            line,
            globals,
            locals,
            global_names: HashSet::new(),
            blocks: Vec::new(),
            jump: None,
            handling: None,
        }
    }

    pub(crate) fn store(&self, name: &str, value: Value) {
        match &self.locals {
            Some(locals) if !self.global_names.contains(name) => {
                locals.borrow_mut().insert(name.to_string(), value);
            }
            _ => {
                self.globals.borrow_mut().insert(name.to_string(), value);
            }
        }
    }

    pub(crate) fn remove(&self, name: &str) {
        match &self.locals {
            Some(locals) if !self.global_names.contains(name) => {
                locals.borrow_mut().remove(name);
            }
            _ => {
                self.globals.borrow_mut().remove(name);
            }
        }
    }
}

fn snapshot(scope: &Scope) -> ScopeSnapshot {
    scope
        .borrow()
        .iter()
        .filter(|(name, _)| !(name.starts_with("__") && name.ends_with("__")))
        .map(|(name, value)| (name.clone(), value.to_json()))
        .collect()
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {0} is not a statement in an active block of this frame")]
pub struct JumpError(pub u32);

/// What a tracer sees of the frame an event fired in.
pub struct FrameView<'a> {
    frame: &'a mut Frame,
}

impl<'a> FrameView<'a> {
    pub(crate) fn new(frame: &'a mut Frame) -> Self {
        Self { frame }
    }

    pub fn id(&self) -> u64 {
        self.frame.id
    }

    /// Id of the calling frame, if any
    pub fn back_id(&self) -> Option<u64> {
        self.frame.back
    }

    /// Function name, or `<module>`
    pub fn code_name(&self) -> &str {
        &self.frame.code_name
    }

    pub fn unit(&self) -> &Path {
        &self.frame.unit
    }

    pub fn line(&self) -> u32 {
        self.frame.line
    }

    pub fn is_module(&self) -> bool {
        self.frame.locals.is_none()
    }

    /// Serialized globals, dunder names excluded.
    pub fn globals(&self) -> ScopeSnapshot {
        snapshot(&self.frame.globals)
    }

    /// Serialized locals. Empty at module level.
    pub fn locals(&self) -> ScopeSnapshot {
        self.frame
            .locals
            .as_ref()
            .map(snapshot)
            .unwrap_or_default()
    }

    /// Continue execution at `line` once the hook returns. The line must
    /// start a statement in a block this frame is currently executing.
    pub fn request_jump(&mut self, line: u32) -> Result<(), JumpError> {
        let reachable = self
            .frame
            .blocks
            .iter()
            .any(|block| block.iter().any(|stmt| stmt.line == line));
        if !reachable {
            return Err(JumpError(line));
        }
        self.frame.jump = Some(line);
        Ok(())
    }

    /// Bind `name` in the frame's local scope.
    pub fn assign(&mut self, name: &str, value: &serde_json::Value) {
        self.frame.store(name, Value::from_json(value));
    }
}

/// Event delivered to a [`TraceHook`].
#[derive(Debug, Clone, Copy)]
pub enum TraceEvent<'e> {
    Call,
    Line,
    Return(&'e Value),
    Exception {
        error: &'e RuntimeError,
        /// Traceback of the frames unwound so far
        traceback: &'e str,
    },
}

impl TraceEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            TraceEvent::Call => "call",
            TraceEvent::Line => "line",
            TraceEvent::Return(_) => "return",
            TraceEvent::Exception { .. } => "exception",
        }
    }
}

/// Callback invoked for every call, line, return and exception event.
pub trait TraceHook {
    fn trace(&mut self, frame: &mut FrameView<'_>, event: TraceEvent<'_>) -> Result<(), Halt>;
}

impl<F> TraceHook for F
where
    F: FnMut(&mut FrameView<'_>, TraceEvent<'_>) -> Result<(), Halt>,
{
    fn trace(&mut self, frame: &mut FrameView<'_>, event: TraceEvent<'_>) -> Result<(), Halt> {
        self(frame, event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Where the script's output goes.
pub trait Output {
    fn write(&mut self, stream: Stream, text: &str);

    fn flush(&mut self, _stream: Stream) {}
}

/// Writes straight to the process's own stdout and stderr.
#[derive(Debug, Default)]
pub struct StdOutput;

impl Output for StdOutput {
    fn write(&mut self, stream: Stream, text: &str) {
        let _ = match stream {
            Stream::Stdout => std::io::stdout().write_all(text.as_bytes()),
            Stream::Stderr => std::io::stderr().write_all(text.as_bytes()),
        };
    }

    fn flush(&mut self, stream: Stream) {
        let _ = match stream {
            Stream::Stdout => std::io::stdout().flush(),
            Stream::Stderr => std::io::stderr().flush(),
        };
    }
}

/// In-memory output. Clones share the same buffers.
#[derive(Debug, Default, Clone)]
pub struct CapturedOutput {
    stdout: Rc<RefCell<String>>,
    stderr: Rc<RefCell<String>>,
}

impl CapturedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout(&self) -> String {
        self.stdout.borrow().clone()
    }

    pub fn stderr(&self) -> String {
        self.stderr.borrow().clone()
    }
}

impl Output for CapturedOutput {
    fn write(&mut self, stream: Stream, text: &str) {
        match stream {
            Stream::Stdout => self.stdout.borrow_mut().push_str(text),
            Stream::Stderr => self.stderr.borrow_mut().push_str(text),
        }
    }
}
