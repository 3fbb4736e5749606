mod backend;
mod registry;
mod remote;
mod types;

#[cfg(feature = "tch-backend")]
pub mod loader;

pub use backend::{FragmentSender, TextGenerator};
pub use registry::{ModelRegistry, RegisteredModel};
pub use remote::{RemoteGenerator, UpstreamChunk, decode_chunk};
pub use types::{DecodeParams, GenerationRequest, ModelKey, ModelMetadata, Sampling, StreamEvent};
