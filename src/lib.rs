pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod listener;
pub mod session;
pub mod streamer;

pub mod postgres;
pub mod transport;

pub use config::Config;
pub use coordinator::Termination;
pub use engine::Engine;
pub use error::{Error, Result};
pub use session::SessionStatus;
