//! Generative backend clients. The pipeline only sees [`TextBackend`]: prompt in, text out
//! (or a stream of raw chunks). No retries here; failures go back to the orchestrator.

use crate::config::{BackendConfig, BackendKind, SamplingParams};
use crate::error::BackendError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Raw backend chunks in emission order.
pub type ChunkStream = BoxStream<'static, Result<Vec<u8>, BackendError>>;

const CONNECT_TIMEOUT_SECS: u64 = 10;

#[async_trait]
pub trait TextBackend: Send + Sync {
    /// One-shot completion. An absent text field yields an empty string, not an error.
    async fn generate(&self, prompt: &str, sampling: &SamplingParams) -> Result<String, BackendError>;

    /// Streaming completion; chunks are forwarded untouched.
    async fn generate_stream(
        &self,
        prompt: &str,
        sampling: &SamplingParams,
    ) -> Result<ChunkStream, BackendError>;

    /// Generated text carried by one complete line of the stream, if any.
    fn extract_text(&self, line: &str) -> Option<String>;
}

/// Build the client named by `cfg.kind`.
pub fn build_backend(cfg: &BackendConfig) -> Arc<dyn TextBackend> {
    match cfg.kind {
        BackendKind::Ollama => Arc::new(OllamaBackend::new(cfg)),
        BackendKind::OpenAiCompatible => Arc::new(OpenAiCompatibleBackend::new(cfg)),
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

fn transport_error(e: reqwest::Error, timeout_secs: u64) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout(timeout_secs)
    } else {
        BackendError::Transport(e)
    }
}

/// Send a prepared request and hand back the response once the status is 2xx.
async fn send_checked(
    request: reqwest::RequestBuilder,
    timeout_secs: u64,
) -> Result<reqwest::Response, BackendError> {
    let res = request
        .send()
        .await
        .map_err(|e| transport_error(e, timeout_secs))?;
    let status = res.status();
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(BackendError::Status(status.as_u16(), body));
    }
    Ok(res)
}

fn into_chunk_stream(res: reqwest::Response) -> ChunkStream {
    res.bytes_stream()
        .map(|chunk| chunk.map(|b| b.to_vec()).map_err(BackendError::Transport))
        .boxed()
}

// ---------------------------------------------------------------------------
// Ollama-style /api/generate
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: Option<String>,
}

/// Local model server. Non-streamed replies carry `response`; streams are NDJSON lines.
pub struct OllamaBackend {
    url: String,
    model: String,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl OllamaBackend {
    pub fn new(cfg: &BackendConfig) -> Self {
        Self {
            url: cfg.url.trim().to_string(),
            model: cfg.model.clone(),
            timeout_secs: cfg.timeout_secs,
            client: http_client(),
        }
    }

    fn request(&self, prompt: &str, sampling: &SamplingParams, stream: bool) -> reqwest::RequestBuilder {
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            stream,
            options: GenerateOptions {
                temperature: sampling.temperature,
                top_p: sampling.top_p,
                num_predict: sampling.max_tokens,
            },
        };
        self.client.post(&self.url).json(&body)
    }
}

#[async_trait]
impl TextBackend for OllamaBackend {
    async fn generate(&self, prompt: &str, sampling: &SamplingParams) -> Result<String, BackendError> {
        tracing::debug!(target: "persona_proxy::backend", model = %self.model, "generate");
        let request = self
            .request(prompt, sampling, false)
            .timeout(Duration::from_secs(self.timeout_secs));
        let res = send_checked(request, self.timeout_secs).await?;
        let text = res
            .text()
            .await
            .map_err(|e| transport_error(e, self.timeout_secs))?;
        let parsed: GenerateResponse =
            serde_json::from_str(&text).map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(parsed.response.unwrap_or_default())
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        sampling: &SamplingParams,
    ) -> Result<ChunkStream, BackendError> {
        tracing::debug!(target: "persona_proxy::backend", model = %self.model, "generate (stream)");
        let res = send_checked(self.request(prompt, sampling, true), self.timeout_secs).await?;
        Ok(into_chunk_stream(res))
    }

    fn extract_text(&self, line: &str) -> Option<String> {
        let parsed: GenerateResponse = serde_json::from_str(line.trim()).ok()?;
        parsed.response.filter(|s| !s.is_empty())
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat completions (OpenRouter and friends)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Option<Vec<ChatChoice>>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatContent>,
    delta: Option<ChatContent>,
}

#[derive(Debug, Deserialize)]
struct ChatContent {
    content: Option<String>,
}

/// Hosted backend. The whole prompt goes out as a single user message so the persona
/// block and transcript reach the model exactly as rendered.
pub struct OpenAiCompatibleBackend {
    url: String,
    model: String,
    api_key: Option<String>,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl OpenAiCompatibleBackend {
    pub fn new(cfg: &BackendConfig) -> Self {
        Self {
            url: cfg.url.trim().to_string(),
            model: cfg.model.clone(),
            api_key: cfg
                .api_key
                .as_deref()
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string),
            timeout_secs: cfg.timeout_secs,
            client: http_client(),
        }
    }

    fn request(&self, prompt: &str, sampling: &SamplingParams, stream: bool) -> reqwest::RequestBuilder {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            max_tokens: sampling.max_tokens,
        };
        let request = self
            .client
            .post(&self.url)
            .header("X-Title", "persona-proxy")
            .json(&body);
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl TextBackend for OpenAiCompatibleBackend {
    async fn generate(&self, prompt: &str, sampling: &SamplingParams) -> Result<String, BackendError> {
        tracing::debug!(target: "persona_proxy::backend", model = %self.model, "chat completion");
        let request = self
            .request(prompt, sampling, false)
            .timeout(Duration::from_secs(self.timeout_secs));
        let res = send_checked(request, self.timeout_secs).await?;
        let text = res
            .text()
            .await
            .map_err(|e| transport_error(e, self.timeout_secs))?;
        let parsed: ChatResponse =
            serde_json::from_str(&text).map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .unwrap_or_default())
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        sampling: &SamplingParams,
    ) -> Result<ChunkStream, BackendError> {
        tracing::debug!(target: "persona_proxy::backend", model = %self.model, "chat completion (stream)");
        let res = send_checked(self.request(prompt, sampling, true), self.timeout_secs).await?;
        Ok(into_chunk_stream(res))
    }

    /// SSE: `data: {...}` carries a delta, `data: [DONE]` ends the stream.
    fn extract_text(&self, line: &str) -> Option<String> {
        let data = line.trim().strip_prefix("data:")?.trim();
        if data == "[DONE]" {
            return None;
        }
        let parsed: ChatResponse = serde_json::from_str(data).ok()?;
        parsed
            .choices?
            .into_iter()
            .next()?
            .delta?
            .content
            .filter(|s| !s.is_empty())
    }
}

/// Reassembles generated text from a chunk stream whose chunk edges ignore line edges.
pub struct StreamCollector<'a> {
    backend: &'a dyn TextBackend,
    pending: Vec<u8>,
    text: String,
}

impl<'a> StreamCollector<'a> {
    pub fn new(backend: &'a dyn TextBackend) -> Self {
        Self {
            backend,
            pending: Vec::new(),
            text: String::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.take_line(&String::from_utf8_lossy(&line));
        }
    }

    /// Flush a trailing line without newline and return everything collected.
    pub fn finish(mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        self.take_line(&String::from_utf8_lossy(&rest));
        self.text
    }

    fn take_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        if let Some(piece) = self.backend.extract_text(line) {
            self.text.push_str(&piece);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ollama() -> OllamaBackend {
        OllamaBackend::new(&BackendConfig::default())
    }

    fn hosted() -> OpenAiCompatibleBackend {
        OpenAiCompatibleBackend::new(&BackendConfig {
            kind: BackendKind::OpenAiCompatible,
            url: "https://openrouter.ai/api/v1/chat/completions".into(),
            api_key: Some("  ".into()),
            ..BackendConfig::default()
        })
    }

    #[test]
    fn ollama_lines() {
        let b = ollama();
        assert_eq!(
            b.extract_text(r#"{"model":"m","response":"Hel","done":false}"#).as_deref(),
            Some("Hel")
        );
        assert_eq!(b.extract_text(r#"{"response":"","done":true}"#), None);
        assert_eq!(b.extract_text("not json"), None);
    }

    #[test]
    fn sse_lines() {
        let b = hosted();
        assert!(b.api_key.is_none());
        assert_eq!(
            b.extract_text(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#).as_deref(),
            Some("Hi")
        );
        assert_eq!(b.extract_text("data: [DONE]"), None);
        assert_eq!(b.extract_text(": keep-alive"), None);
    }

    #[test]
    fn collector_handles_split_lines() {
        let b = ollama();
        let mut c = StreamCollector::new(&b);
        c.push(br#"{"response":"Hel"#);
        c.push(b"lo\"}\n{\"response\":\" th");
        c.push(br#"ere"}"#);
        assert_eq!(c.finish(), "Hello there");
    }
}
