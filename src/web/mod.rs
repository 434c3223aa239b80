//! HTTP and websocket front door.

mod error;
pub mod layout;
pub mod relay;
mod server;
mod ws;

pub use error::WebError;
pub use relay::{relay, RelayError};
pub use server::{build_router, run_server, WebAppState};
