pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod http;
pub mod modules;
pub mod observability;
pub mod response;
pub mod router;
pub mod server;
mod static_files;
pub mod task_pool;

pub use config::ServerConfig;
pub use dispatch::Dispatcher;
pub use engine::{Bootstrap, EnginePool, InterpreterGuard};
pub use error::EngineError;

/// Default value of the `Server` response header.
pub const SERVER_NAME: &str = concat!("lume/", env!("CARGO_PKG_VERSION"));
