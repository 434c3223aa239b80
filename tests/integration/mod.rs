//! Integration tests for rewind
//!
//! These tests verify that multiple components work together correctly.

#[path = "../common/mod.rs"]
pub mod common;

pub mod cli;
pub mod rewind_flow;
pub mod session_flow;
