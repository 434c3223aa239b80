//! Data persistence layer for rewind
//!
//! This module provides SQLite-based storage for traced targets, their
//! session pointers, and the recorded execution timeline.

mod database;
mod migrations;
mod models;
mod timeline;

pub use database::{Database, DatabaseError};
pub use models::{EventKind, SessionPointer, TimelineEvent};
pub use timeline::TimelineStore;
