//! Persona proxy core.
//! Session and fact stores, deterministic interceptors, prompt assembly, backend clients,
//! output sanitizing and the turn orchestrator that ties them together.

pub mod backend;
pub mod config;
pub mod error;
pub mod facts;
pub mod intercept;
pub mod orchestrator;
pub mod prompt;
pub mod sanitizer;
pub mod session;
pub mod signals;

pub use backend::{build_backend, ChunkStream, OllamaBackend, OpenAiCompatibleBackend, StreamCollector, TextBackend};
pub use config::{BackendConfig, BackendKind, KnowledgeConfig, PersonaConfig, ProxyConfig, SamplingParams, ServerConfig};
pub use error::{BackendError, ConfigError, PipelineError, PipelineResult, StoreError};
pub use facts::{FactStore, InMemoryFactStore};
pub use intercept::{InterceptKind, Interception, Interceptor};
pub use orchestrator::{ReplySource, ReplyStream, TurnOrchestrator, TurnReply, TurnRequest};
pub use prompt::PromptBuilder;
pub use sanitizer::Sanitizer;
pub use session::{InMemorySessionStore, Role, SessionId, SessionStore, Turn};
pub use signals::Emotion;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
