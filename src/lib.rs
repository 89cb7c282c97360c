pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod inference;
pub mod midi;
pub mod session;
pub mod timing;
pub mod tokens;

pub use config::{PortConfig, RuntimeConfig, watch_sampling};
pub use engine::{EngineCommand, EngineHandle, EngineUpdate, spawn_engine};
pub use error::{Error, Result};
pub use session::GenerationSession;
