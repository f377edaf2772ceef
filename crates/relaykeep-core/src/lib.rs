pub mod backoff;
pub mod config;
pub mod connection;
pub mod cooldown;
pub mod error;
pub mod parser;
pub mod policy;
pub mod queue;
pub mod resolve;
pub mod session;
pub mod supervisor;

pub use config::{EngineConfig, RelaykeepConfig, SessionConfig};
pub use session::{SessionDeps, SessionHandle, SessionSnapshot, spawn_session};
pub use supervisor::{ProcessFault, Supervisor};
