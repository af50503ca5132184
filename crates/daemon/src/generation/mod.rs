// Streaming text generation: providers, SSE decoding, the registry of
// in-flight requests and the orchestrator that ties them to documents.

pub mod orchestrator;
pub mod provider;
pub mod registry;
pub mod seed;
pub mod sse;
pub mod upstream;

pub use orchestrator::{GenerationState, StreamOrchestrator};
pub use registry::{GenerationRegistry, GenerationRequest};
