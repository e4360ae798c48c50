pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use error::{ErrorClass, Result, TrellisError};
pub use event::EventBus;
pub use types::*;
