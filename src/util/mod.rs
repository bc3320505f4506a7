//! Shared utilities

mod socket;
mod tracing_setup;

pub use socket::{create_listener, tune_stream};
pub use tracing_setup::init_tracing;
