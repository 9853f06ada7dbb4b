//! JSON-lines IPC surface: request/response envelope, shared handler
//! helpers, and the method router over the per-domain handler modules.

mod error;
mod handlers;
mod helpers;
mod router;
mod types;

pub use router::handle_request;
pub use types::{AppState, Request};
