pub mod args;
pub mod client;
mod error;
pub(crate) mod protocol;
pub mod rate;
pub mod server;
pub mod session;
pub mod settings;
pub mod stats;
pub(crate) mod stream;
pub(crate) mod utils;

pub use error::{BoxResult, ConfigError, Error, Result};
pub use protocol::results as report;
pub use protocol::state::{AbortReason, SessionState};
