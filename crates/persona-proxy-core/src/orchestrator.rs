//! Turn orchestrator: resolve session -> intercept -> (short-circuit | backend) -> sanitize
//! -> persist -> reply.
//!
//! Backend failures never reach the caller; the configured fallback text stands in for the
//! raw reply and flows through sanitizing and persistence like any other reply. Only store
//! failures surface, as [`PipelineError`].

use crate::backend::{build_backend, ChunkStream, StreamCollector, TextBackend};
use crate::config::{PersonaConfig, ProxyConfig, SamplingParams};
use crate::error::{PipelineError, PipelineResult};
use crate::facts::{FactStore, InMemoryFactStore};
use crate::intercept::{InterceptKind, Interception, Interceptor};
use crate::prompt::PromptBuilder;
use crate::sanitizer::Sanitizer;
use crate::session::{InMemorySessionStore, SessionId, SessionStore, Turn};
use crate::signals::{detect_emotion, estimate_tokens, system_time, Emotion};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub const CONFIDENCE_GENERATED: f32 = 0.75;

const STREAM_CHANNEL_CAPACITY: usize = 64;

/// One inbound user message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TurnRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Situational context rendered into the prompt, e.g. "user just opened Paint".
    #[serde(default)]
    pub context: Option<String>,
}

impl TurnRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Where a reply came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySource {
    Intercepted(InterceptKind),
    Generated,
    /// Backend failed; the fallback text was used.
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub reply: String,
    pub session_id: SessionId,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<Emotion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_time: Option<String>,
    #[serde(skip)]
    pub source: ReplySource,
}

impl TurnReply {
    fn intercepted(session_id: SessionId, hit: Interception) -> Self {
        Self {
            reply: hit.reply,
            session_id,
            confidence: hit.confidence,
            tokens: None,
            emotion: None,
            system_time: None,
            source: ReplySource::Intercepted(hit.kind),
        }
    }
}

/// A streamed reply: the session it belongs to plus raw chunks for the caller.
pub struct ReplyStream {
    pub session_id: SessionId,
    pub chunks: BoxStream<'static, Vec<u8>>,
}

pub struct TurnOrchestrator {
    sessions: Arc<dyn SessionStore>,
    interceptor: Interceptor,
    prompts: PromptBuilder,
    sanitizer: Sanitizer,
    backend: Arc<dyn TextBackend>,
    sampling: SamplingParams,
    /// Longest wait for the next streamed chunk before the reply is cut off.
    stream_idle: Duration,
    persona: PersonaConfig,
}

impl TurnOrchestrator {
    /// Wire the pipeline over explicit stores and backend.
    pub fn new(
        cfg: &ProxyConfig,
        sessions: Arc<dyn SessionStore>,
        facts: Arc<dyn FactStore>,
        backend: Arc<dyn TextBackend>,
    ) -> Self {
        let persona = cfg.persona.clone();
        Self {
            sessions,
            interceptor: Interceptor::new(persona.clone(), cfg.knowledge.clone(), facts),
            prompts: PromptBuilder::new(persona.instructions(), persona.name.clone()),
            sanitizer: Sanitizer::new(&persona, &cfg.knowledge.banned_vocabulary),
            backend,
            sampling: cfg.backend.sampling.clone(),
            stream_idle: Duration::from_secs(cfg.backend.timeout_secs),
            persona,
        }
    }

    /// Volatile in-memory stores and the configured backend client.
    pub fn from_config(cfg: &ProxyConfig) -> Self {
        Self::new(
            cfg,
            Arc::new(InMemorySessionStore::new(cfg.persona.max_history)),
            Arc::new(InMemoryFactStore::new()),
            build_backend(&cfg.backend),
        )
    }

    pub fn persona(&self) -> &PersonaConfig {
        &self.persona
    }

    pub async fn respond(&self, req: TurnRequest) -> PipelineResult<TurnReply> {
        let session_id = self.sessions.resolve(req.session_id.as_deref())?;
        let message = req.message.trim();

        if let Some(hit) = self.interceptor.intercept(&session_id, message)? {
            tracing::debug!(target: "persona_proxy::pipeline", session = %session_id, kind = ?hit.kind, "short-circuit");
            return Ok(TurnReply::intercepted(session_id, hit));
        }

        let emotion = detect_emotion(message);
        let prompt = self.prompt_for(&session_id, message, req.context.as_deref())?;

        let (raw, source) = match self.backend.generate(&prompt, &self.sampling).await {
            Ok(text) => (text, ReplySource::Generated),
            Err(e) => {
                tracing::warn!(target: "persona_proxy::pipeline", session = %session_id, error = %e, "backend failed; using fallback reply");
                (self.persona.fallback_reply.clone(), ReplySource::Fallback)
            }
        };

        let reply = self.sanitizer.sanitize(&raw);
        self.persist_exchange(&session_id, message, &reply)?;

        tracing::info!(
            target: "persona_proxy::pipeline",
            session = %session_id,
            source = ?source,
            chars = reply.chars().count(),
            "reply ready"
        );

        Ok(TurnReply {
            tokens: Some(estimate_tokens(&format!("{} {}", prompt, reply))),
            reply,
            session_id,
            confidence: CONFIDENCE_GENERATED,
            emotion: Some(emotion),
            system_time: Some(system_time()),
            source,
        })
    }

    /// Streaming variant. Intercepted and fallback replies arrive as a single chunk; live
    /// backend chunks are relayed verbatim and unsanitized. The backend is drained on its
    /// own task, so the exchange is persisted even if the caller goes away mid-stream.
    pub async fn respond_stream(self: &Arc<Self>, req: TurnRequest) -> PipelineResult<ReplyStream> {
        let session_id = self.sessions.resolve(req.session_id.as_deref())?;
        let message = req.message.trim().to_string();

        if let Some(hit) = self.interceptor.intercept(&session_id, &message)? {
            return Ok(single_chunk(session_id, hit.reply));
        }

        let prompt = self.prompt_for(&session_id, &message, req.context.as_deref())?;
        match self.backend.generate_stream(&prompt, &self.sampling).await {
            Ok(chunks) => {
                let (tx, rx) = mpsc::channel::<Vec<u8>>(STREAM_CHANNEL_CAPACITY);
                let this = Arc::clone(self);
                let sid = session_id.clone();
                tokio::spawn(async move { this.relay(sid, message, chunks, tx).await });
                Ok(ReplyStream {
                    session_id,
                    chunks: ReceiverStream::new(rx).boxed(),
                })
            }
            Err(e) => {
                tracing::warn!(target: "persona_proxy::pipeline", session = %session_id, error = %e, "backend stream failed; using fallback reply");
                let reply = self.sanitizer.sanitize(&self.persona.fallback_reply);
                self.persist_exchange(&session_id, &message, &reply)?;
                Ok(single_chunk(session_id, reply))
            }
        }
    }

    async fn relay(&self, session_id: SessionId, message: String, mut chunks: ChunkStream, tx: mpsc::Sender<Vec<u8>>) {
        let mut collector = StreamCollector::new(self.backend.as_ref());
        let mut caller_gone = false;

        loop {
            let item = match tokio::time::timeout(self.stream_idle, chunks.next()).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(target: "persona_proxy::pipeline", session = %session_id, idle_secs = self.stream_idle.as_secs(), "backend stream stalled; keeping partial reply");
                    break;
                }
            };
            match item {
                Ok(chunk) => {
                    collector.push(&chunk);
                    if !caller_gone && tx.send(chunk).await.is_err() {
                        tracing::debug!(target: "persona_proxy::pipeline", session = %session_id, "caller left; draining backend");
                        caller_gone = true;
                    }
                }
                Err(e) => {
                    tracing::warn!(target: "persona_proxy::pipeline", session = %session_id, error = %e, "backend stream ended with error");
                    break;
                }
            }
        }

        // `tx` lives until the exchange is stored, so end-of-stream means persisted.
        let reply = self.sanitizer.sanitize(&collector.finish());
        if let Err(e) = self.persist_exchange(&session_id, &message, &reply) {
            tracing::error!(target: "persona_proxy::pipeline", session = %session_id, error = %e, "could not persist streamed exchange");
        }
    }

    /// Stored history plus the pending user turn; nothing is written yet.
    fn prompt_for(&self, session_id: &str, message: &str, context: Option<&str>) -> Result<String, PipelineError> {
        let mut history = self.sessions.read(session_id)?;
        history.push(Turn::user(message));
        Ok(self.prompts.build(&history, context))
    }

    fn persist_exchange(&self, session_id: &str, message: &str, reply: &str) -> Result<(), PipelineError> {
        self.sessions.append(session_id, Turn::user(message))?;
        self.sessions.append(session_id, Turn::assistant(reply))?;
        Ok(())
    }
}

fn single_chunk(session_id: SessionId, reply: String) -> ReplyStream {
    ReplyStream {
        session_id,
        chunks: futures_util::stream::once(async move { reply.into_bytes() }).boxed(),
    }
}
