//! Embedded interpreter for the traced script language.
//!
//! Scripts are a Python subset. Every executed statement, function entry,
//! function exit and raised exception is reported to a [`TraceHook`], which
//! can inspect the frame's scopes, rebind locals, redirect execution to
//! another line of the frame, or halt the run.

mod ast;
mod builtins;
mod error;
mod eval;
mod frame;
mod lexer;
mod parser;
mod value;

pub use error::{ExecError, Halt, RuntimeError, SyntaxError, TraceEntry};
pub use eval::{Interpreter, DEFAULT_RECURSION_LIMIT};
pub use frame::{
    CapturedOutput, FrameView, JumpError, Output, StdOutput, Stream, TraceEvent, TraceHook,
};
pub use parser::{imported_modules, parse_module};
pub use value::{Value, MAX_JSON_DEPTH};

/// Stack size for threads that run scripts; deep script recursion nests
/// several evaluator frames per script call.
pub const INTERPRETER_STACK_SIZE: usize = 256 * 1024 * 1024;
