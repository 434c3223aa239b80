pub mod checkpoint;
pub mod config;
pub mod data;
pub mod interp;
pub mod mailbox;
pub mod protocol;
pub mod scope;
pub mod supervisor;
pub mod tracer;
pub mod util;
pub mod web;

pub use checkpoint::{CheckpointError, Checkpointer, CriuCheckpointer, MemoryCheckpointer};
pub use config::Config;
pub use data::{Database, TimelineEvent, TimelineStore};
pub use mailbox::{Channel, Mailbox};
pub use supervisor::{SessionManager, Supervisor};
pub use tracer::{TraceOutcome, Tracer};
pub use util::Paths;
