//! # Meraki Voice - Real-Time Conversation Orchestration
//!
//! This crate implements the streaming voice agent pipeline behind Meraki:
//! speech-to-text, language generation, and speech synthesis stitched into a
//! low-latency conversation loop with barge-in interruption.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  Conversation Orchestrator                    │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐       │
//! │  │  Audio In    │→ │  AssemblyAI  │→ │   Session    │       │
//! │  │ (WebSocket)  │  │  Streaming   │  │ State Machine│       │
//! │  └──────────────┘  └──────────────┘  └──────┬───────┘       │
//! │         ↓ barge-in                          ↓                │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐       │
//! │  │   Energy     │  │   Murf TTS   │← │ Gemini SSE   │       │
//! │  │   Detector   │  │  (reorder)   │  │ (sentences)  │       │
//! │  └──────────────┘  └──────────────┘  └──────────────┘       │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod chunker;
pub mod config;
pub mod error;
pub mod llm;
pub mod memory;
pub mod news;
pub mod protocol;
pub mod session;
pub mod stt;
pub mod tts;
pub mod vad;

pub use chunker::{ChunkStrategy, ChunkerConfig, SentenceChunker};
pub use config::{SessionConfig, FALLBACK_TEXT, PERSONA};
pub use error::{AgentError, AgentResult};
pub use llm::{GeminiBackend, GenerationBackend, GenerationChunk, GenerationRequest};
pub use memory::{Role, SessionMemory, Turn};
pub use news::{headlines_context, wants_headlines, NewsLookup};
pub use protocol::{ClientMessage, ServerMessage};
pub use session::{Session, SessionEvent, SessionState};
pub use stt::{
    spawn_transcriber, SttCommand, SttConfig, TranscriptEvent, TranscriptKind,
};
pub use tts::{MurfTts, ReorderBuffer, SynthesisBackend, SynthesisChunk, TtsConfig};
pub use vad::{BargeInConfig, BargeInDetector};
