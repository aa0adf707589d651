pub mod error;
pub mod guard;
mod handlers;
pub mod params;
pub mod router;
pub mod types;

pub use router::handle_request;
pub use types::{AppState, Request};
