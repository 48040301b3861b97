mod error;
mod handlers;
mod helpers;
mod router;
mod types;

pub use handlers::core::open_workspace;
pub use router::{handle_request, pending_events};
pub use types::{AppState, Request};
