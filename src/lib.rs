pub mod config;
pub mod download;
pub mod error;
pub mod language;
pub mod model;
pub mod pipeline;
pub mod prompt;
pub mod server;
pub mod transport;

pub use config::AppConfig;
pub use model::{GenerationRequest, ModelRegistry, StreamEvent};
pub use pipeline::Orchestrator;
pub use server::build_router;
