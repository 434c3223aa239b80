//! Shared test utilities for rewind
//!
//! This module provides common helpers for integration tests:
//! - Isolated state directories with a registered target script
//! - Tracers running on threads that stand in for traced processes

pub mod fixtures;
