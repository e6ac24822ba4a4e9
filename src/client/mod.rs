//! Provider clients, registry, and quota limiter.

mod gemini;
mod llm_client;
mod rate_limiter;
mod sse;
mod registry;

pub use gemini::*;
pub use llm_client::*;
pub use rate_limiter::*;
pub use registry::*;
pub use sse::ChunkStream;
