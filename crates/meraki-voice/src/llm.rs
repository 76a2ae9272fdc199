//! **Generation Stream Adapter** — one streaming text-generation call per
//! assistant response.
//!
//! The backend receives the remembered conversation (oldest-first), the
//! persona, and optional tool context, and emits ordered [`GenerationChunk`]s
//! onto the session queue. Cancellation is cooperative: once the token fires,
//! no further chunks are emitted and network consumption stops.

use crate::error::{AgentError, AgentResult};
use crate::memory::{Role, Turn};
use crate::session::SessionEvent;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ordered fragment of the assistant response. Concatenating chunk text in
/// arrival order reconstructs the full utterance; `done` marks the end.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationChunk {
    pub text: String,
    pub done: bool,
}

impl GenerationChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: false,
        }
    }

    pub fn done() -> Self {
        Self {
            text: String::new(),
            done: true,
        }
    }
}

/// Everything one streaming call needs.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Fixed system persona description.
    pub persona: String,
    /// Remembered turns, oldest first.
    pub turns: Vec<Turn>,
    /// Optional tool result (e.g. headlines) injected as extra context.
    pub tool_context: Option<String>,
}

/// Seam for the streaming language-model call. The production backend talks
/// to Gemini; tests script chunk sequences and failures.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Stream one response. Emit `SessionEvent::Generation { id, chunk }` in
    /// order, ending with a `done` chunk. Return `Err` only when no response
    /// could be produced; stop silently when `cancel` fires.
    async fn stream(
        &self,
        request: GenerationRequest,
        generation_id: u64,
        events: mpsc::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) -> AgentResult<()>;
}

/// Gemini streaming backend (`streamGenerateContent?alt=sse`).
#[derive(Debug, Clone)]
pub struct GeminiBackend {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub first_byte_timeout: Duration,
    client: reqwest::Client,
}

impl GeminiBackend {
    /// Build from environment: `GEMINI_API_KEY` (required), `GEMINI_MODEL`
    /// (default gemini-1.5-flash), `GEMINI_API_URL` (optional override).
    pub fn from_env() -> AgentResult<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| AgentError::Config("GEMINI_API_KEY not set".to_string()))?;
        let model =
            std::env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-1.5-flash".to_string());
        let base_url = std::env::var("GEMINI_API_URL")
            .unwrap_or_else(|_| "https://generativelanguage.googleapis.com".to_string());
        Self::new(base_url, api_key, model)
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> AgentResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AgentError::Generation(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            first_byte_timeout: Duration::from_secs(10),
            client,
        })
    }

    pub fn with_first_byte_timeout(mut self, timeout: Duration) -> Self {
        self.first_byte_timeout = timeout;
        self
    }

    fn request_body(request: &GenerationRequest) -> serde_json::Value {
        let mut contents: Vec<serde_json::Value> = request
            .turns
            .iter()
            .map(|turn| {
                let role = match turn.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                };
                serde_json::json!({
                    "role": role,
                    "parts": [{ "text": turn.text }],
                })
            })
            .collect();

        // Tool context rides in as an extra user part just ahead of the
        // final user message, so the model sees it as fresh information.
        if let Some(ref context) = request.tool_context {
            let insert_at = contents.len().saturating_sub(1);
            contents.insert(
                insert_at,
                serde_json::json!({
                    "role": "user",
                    "parts": [{ "text": context }],
                }),
            );
        }

        serde_json::json!({
            "system_instruction": { "parts": [{ "text": request.persona }] },
            "contents": contents,
        })
    }

    /// Extract the delta text from one SSE data payload.
    fn parse_sse_data(data: &str) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(data).ok()?;
        let text = value
            .get("candidates")?
            .get(0)?
            .get("content")?
            .get("parts")?
            .get(0)?
            .get("text")?
            .as_str()?;
        Some(text.to_string())
    }
}

#[async_trait]
impl GenerationBackend for GeminiBackend {
    async fn stream(
        &self,
        request: GenerationRequest,
        generation_id: u64,
        events: mpsc::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) -> AgentResult<()> {
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            self.api_key,
        );
        let body = Self::request_body(&request);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = self.client.post(&url).json(&body).send() => {
                res.map_err(|e| AgentError::Generation(format!("request failed: {e}")))?
            }
        };
        if !response.status().is_success() {
            return Err(AgentError::Generation(format!(
                "API error: {}",
                response.status()
            )));
        }

        let mut stream = response.bytes_stream();
        let mut line_buffer = String::new();
        let mut emitted_any = false;

        loop {
            let next = if emitted_any {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Generation {} cancelled, dropping stream", generation_id);
                        return Ok(());
                    }
                    chunk = stream.next() => chunk,
                }
            } else {
                // Bounded wait for the first byte; a stalled provider is a
                // generation failure, not a hung session.
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    timed = tokio::time::timeout(self.first_byte_timeout, stream.next()) => {
                        timed.map_err(|_| AgentError::Timeout("first generation byte".to_string()))?
                    }
                }
            };

            let Some(chunk) = next else { break };
            let bytes = chunk.map_err(|e| {
                if emitted_any {
                    // Mid-stream drop: surface what we have rather than nothing.
                    warn!("Generation stream error after first chunk: {}", e);
                    AgentError::Generation(format!("stream interrupted: {e}"))
                } else {
                    AgentError::Generation(format!("stream error: {e}"))
                }
            })?;
            line_buffer.push_str(&String::from_utf8_lossy(&bytes));

            // SSE frames may split across network chunks; only complete lines parse.
            while let Some(newline) = line_buffer.find('\n') {
                let line: String = line_buffer.drain(..=newline).collect();
                let line = line.trim();
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    continue;
                }
                if let Some(delta) = Self::parse_sse_data(data) {
                    if delta.is_empty() {
                        continue;
                    }
                    debug!("generation {} delta: {:?}", generation_id, delta);
                    emitted_any = true;
                    if events
                        .send(SessionEvent::Generation {
                            id: generation_id,
                            chunk: GenerationChunk::text(delta),
                        })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
            }
        }

        if !emitted_any {
            return Err(AgentError::Generation(
                "provider returned an empty response".to_string(),
            ));
        }
        let _ = events
            .send(SessionEvent::Generation {
                id: generation_id,
                chunk: GenerationChunk::done(),
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn turn(role: Role, text: &str, seq: u64) -> Turn {
        Turn {
            role,
            text: text.to_string(),
            timestamp: Utc::now(),
            seq,
        }
    }

    #[test]
    fn request_body_maps_roles_oldest_first() {
        let request = GenerationRequest {
            persona: "persona".to_string(),
            turns: vec![
                turn(Role::User, "hi", 0),
                turn(Role::Assistant, "hello!", 1),
                turn(Role::User, "how are you?", 2),
            ],
            tool_context: None,
        };
        let body = GeminiBackend::request_body(&request);
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["parts"][0]["text"], "how are you?");
        assert_eq!(body["system_instruction"]["parts"][0]["text"], "persona");
    }

    #[test]
    fn tool_context_lands_before_final_user_message() {
        let request = GenerationRequest {
            persona: "p".to_string(),
            turns: vec![turn(Role::User, "any news?", 0)],
            tool_context: Some("Current headlines:\n- Example".to_string()),
        };
        let body = GeminiBackend::request_body(&request);
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert!(contents[0]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .starts_with("Current headlines"));
        assert_eq!(contents[1]["parts"][0]["text"], "any news?");
    }

    #[test]
    fn sse_data_parsing_extracts_delta() {
        let data = r#"{"candidates":[{"content":{"parts":[{"text":"Hi there"}],"role":"model"}}]}"#;
        assert_eq!(
            GeminiBackend::parse_sse_data(data),
            Some("Hi there".to_string())
        );
        assert_eq!(GeminiBackend::parse_sse_data("{}"), None);
        assert_eq!(GeminiBackend::parse_sse_data("garbage"), None);
    }
}
