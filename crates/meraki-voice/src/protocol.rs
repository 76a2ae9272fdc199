//! Wire messages for the client transport.
//!
//! One persistent bidirectional WebSocket per session: microphone PCM arrives
//! as binary frames, everything else is JSON text frames. Message kinds and
//! their sequencing mirror what the orchestrator guarantees; the frontend
//! only ever sees these shapes.

use serde::{Deserialize, Serialize};

/// JSON control messages from the client. Raw audio is carried as binary
/// frames, not JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Stop listening now and finalize the current transcript.
    Stop,
    /// Drop conversation memory and return to idle.
    Reset,
}

/// Messages relayed to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Provisional recognition result, for live display only.
    PartialTranscript { text: String },
    /// Finalized user utterance; closes the listening phase.
    FinalTranscript { text: String },
    /// Incremental assistant text, in generation order.
    AssistantChunk { text: String },
    /// Synthesized audio, base64-encoded, in submission order.
    AudioChunk { audio_base64: String, format: String },
    /// The assistant finished a full turn (text and any audio delivered).
    TurnComplete { text: String },
    /// A failure the user should know about. `kind` is stable
    /// (`transcription`, `generation`, `synthesis`, ...), `message` is human-readable.
    Error { kind: String, message: String },
}

impl ServerMessage {
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_round_trip() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Stop);
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"reset"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Reset);
    }

    #[test]
    fn server_messages_are_tagged() {
        let json = serde_json::to_string(&ServerMessage::PartialTranscript {
            text: "hel".into(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"partial_transcript""#));

        let json = serde_json::to_string(&ServerMessage::error("generation", "boom")).unwrap();
        assert!(json.contains(r#""kind":"generation""#));
    }
}
