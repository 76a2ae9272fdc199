//! **Transcript Stream Adapter** — one streaming speech-to-text connection
//! per session, normalized into [`TranscriptEvent`]s.
//!
//! Audio frames are forwarded verbatim; provider message shapes (AssemblyAI
//! realtime, both the v3 Turn shape and the older Partial/FinalTranscript
//! shape) are normalized by a pure parser. The adapter keeps no state beyond
//! the current partial text. One reconnect is attempted on upstream drop;
//! a second failure surfaces as a transcription error on the session queue.

use crate::error::{AgentError, AgentResult};
use crate::session::SessionEvent;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Whether a transcript is provisional or closes the user's turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptKind {
    Partial,
    Final,
}

/// Normalized speech-to-text result.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub kind: TranscriptKind,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEvent {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            kind: TranscriptKind::Partial,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn final_(text: impl Into<String>) -> Self {
        Self {
            kind: TranscriptKind::Final,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_final(&self) -> bool {
        self.kind == TranscriptKind::Final
    }
}

/// Commands the session sends to its transcriber task.
#[derive(Debug)]
pub enum SttCommand {
    /// Raw PCM16 frame to forward upstream.
    Audio(Vec<u8>),
    /// Force the current utterance to finalize now (user pressed stop).
    Finalize,
    /// Tear the upstream connection down.
    Close,
}

/// Normalize one provider text message into a [`TranscriptEvent`].
/// Unknown or housekeeping shapes (Begin, Termination, ...) yield `None`.
pub fn parse_provider_message(raw: &str) -> Option<TranscriptEvent> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;

    // v3 shape: {"type":"Turn","transcript":"...","end_of_turn":bool}
    if value.get("type").and_then(|t| t.as_str()) == Some("Turn") {
        let text = value.get("transcript")?.as_str()?.to_string();
        if text.trim().is_empty() {
            return None;
        }
        let final_ = value
            .get("end_of_turn")
            .and_then(|b| b.as_bool())
            .unwrap_or(false);
        return Some(if final_ {
            TranscriptEvent::final_(text)
        } else {
            TranscriptEvent::partial(text)
        });
    }

    // Older shape: {"message_type":"PartialTranscript"|"FinalTranscript","text":"..."}
    match value.get("message_type").and_then(|t| t.as_str()) {
        Some("PartialTranscript") => {
            let text = value.get("text")?.as_str()?.to_string();
            if text.trim().is_empty() {
                return None;
            }
            Some(TranscriptEvent::partial(text))
        }
        Some("FinalTranscript") => {
            let text = value.get("text")?.as_str()?.to_string();
            if text.trim().is_empty() {
                return None;
            }
            Some(TranscriptEvent::final_(text))
        }
        _ => None,
    }
}

/// Configuration for the streaming speech-to-text connection.
#[derive(Debug, Clone)]
pub struct SttConfig {
    /// WebSocket endpoint, sample-rate query appended on connect.
    pub endpoint: String,
    /// Provider API key (sent as the Authorization header).
    pub api_key: String,
    pub sample_rate: u32,
    /// Bounded wait for the connection handshake; a stalled provider is a
    /// transcription failure, not a hung session.
    pub connect_timeout: Duration,
}

impl SttConfig {
    /// Build from environment: `ASSEMBLYAI_API_KEY` (required),
    /// `ASSEMBLYAI_STREAMING_URL` (optional override).
    pub fn from_env() -> AgentResult<Self> {
        let api_key = std::env::var("ASSEMBLYAI_API_KEY")
            .map_err(|_| AgentError::Config("ASSEMBLYAI_API_KEY not set".to_string()))?;
        let endpoint = std::env::var("ASSEMBLYAI_STREAMING_URL")
            .unwrap_or_else(|_| "wss://streaming.assemblyai.com/v3/ws".to_string());
        Ok(Self {
            endpoint,
            api_key,
            sample_rate: 16_000,
            connect_timeout: Duration::from_secs(10),
        })
    }
}

/// Spawn the transcriber task: consumes [`SttCommand`]s, pushes normalized
/// transcript events (and a single fatal error at most) onto the session queue.
pub fn spawn_transcriber(
    config: SttConfig,
    commands: mpsc::Receiver<SttCommand>,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = run_transcriber(config, commands, &events, cancel).await {
            warn!("Transcriber ended with error: {}", e);
            let _ = events
                .send(SessionEvent::TranscriptionFailed {
                    message: e.to_string(),
                })
                .await;
        }
    })
}

async fn run_transcriber(
    config: SttConfig,
    mut commands: mpsc::Receiver<SttCommand>,
    events: &mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) -> AgentResult<()> {
    // One reconnect with the same cursor, then give up.
    let mut attempts_left = 2u8;
    'connection: while attempts_left > 0 {
        attempts_left -= 1;
        let mut ws = tokio::time::timeout(config.connect_timeout, connect(&config))
            .await
            .map_err(|_| AgentError::Timeout("transcriber connection".to_string()))??;
        info!("Transcriber connected ({})", config.endpoint);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = ws.send(WsMessage::Text(r#"{"type":"Terminate"}"#.to_string())).await;
                    let _ = ws.close(None).await;
                    return Ok(());
                }
                cmd = commands.recv() => match cmd {
                    Some(SttCommand::Audio(frame)) => {
                        if ws.send(WsMessage::Binary(frame)).await.is_err() {
                            warn!("Transcriber write failed, reconnecting");
                            continue 'connection;
                        }
                    }
                    Some(SttCommand::Finalize) => {
                        if ws
                            .send(WsMessage::Text(r#"{"type":"ForceEndpoint"}"#.to_string()))
                            .await
                            .is_err()
                        {
                            continue 'connection;
                        }
                    }
                    Some(SttCommand::Close) | None => {
                        let _ = ws.send(WsMessage::Text(r#"{"type":"Terminate"}"#.to_string())).await;
                        let _ = ws.close(None).await;
                        return Ok(());
                    }
                },
                frame = ws.next() => match frame {
                    Some(Ok(WsMessage::Text(raw))) => {
                        if let Some(event) = parse_provider_message(&raw) {
                            debug!(kind = ?event.kind, "transcript: {}", event.text);
                            if events.send(SessionEvent::Transcript(event)).await.is_err() {
                                return Ok(()); // session gone
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        warn!("Transcriber upstream closed, reconnecting");
                        continue 'connection;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Transcriber upstream error: {}", e);
                        continue 'connection;
                    }
                },
            }
        }
    }
    Err(AgentError::Transcription(
        "speech-to-text stream lost and reconnect failed".to_string(),
    ))
}

async fn connect(
    config: &SttConfig,
) -> AgentResult<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
> {
    let url = format!("{}?sample_rate={}", config.endpoint, config.sample_rate);
    let mut request = url
        .into_client_request()
        .map_err(|e| AgentError::Transcription(e.to_string()))?;
    request.headers_mut().insert(
        "Authorization",
        config
            .api_key
            .parse()
            .map_err(|_| AgentError::Config("API key is not a valid header value".to_string()))?,
    );
    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| AgentError::Transcription(format!("connect failed: {e}")))?;
    Ok(ws)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v3_turn_messages() {
        let partial = parse_provider_message(
            r#"{"type":"Turn","transcript":"hello wor","end_of_turn":false}"#,
        )
        .unwrap();
        assert_eq!(partial.kind, TranscriptKind::Partial);
        assert_eq!(partial.text, "hello wor");

        let final_ = parse_provider_message(
            r#"{"type":"Turn","transcript":"hello world","end_of_turn":true}"#,
        )
        .unwrap();
        assert!(final_.is_final());
        assert_eq!(final_.text, "hello world");
    }

    #[test]
    fn parses_legacy_transcript_messages() {
        let partial =
            parse_provider_message(r#"{"message_type":"PartialTranscript","text":"hey"}"#).unwrap();
        assert_eq!(partial.kind, TranscriptKind::Partial);

        let final_ =
            parse_provider_message(r#"{"message_type":"FinalTranscript","text":"hey there"}"#)
                .unwrap();
        assert!(final_.is_final());
    }

    #[test]
    fn ignores_housekeeping_and_empty_messages() {
        assert!(parse_provider_message(r#"{"type":"Begin","id":"abc"}"#).is_none());
        assert!(parse_provider_message(r#"{"type":"Termination"}"#).is_none());
        assert!(parse_provider_message(
            r#"{"type":"Turn","transcript":"  ","end_of_turn":false}"#
        )
        .is_none());
        assert!(parse_provider_message("not json").is_none());
    }
}
