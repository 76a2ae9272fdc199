//! Session configuration and the Meraki persona.

use crate::chunker::ChunkerConfig;
use crate::vad::BargeInConfig;
use std::time::Duration;

/// System persona sent with every generation request. Kept short because the
/// replies are converted to speech.
pub const PERSONA: &str = "\
You are Meraki, a cheerful and funny AI voice companion with the personality \
of a friendly neighborhood Spider-Man: upbeat, quick-witted, a little playful, \
but serious and focused when the topic calls for it. Open casual conversations \
with greetings like \"What's up doc?\". Keep responses concise and natural \
(one or two sentences) since they will be spoken aloud.";

/// Message spoken/shown when generation fails mid-turn.
pub const FALLBACK_TEXT: &str = "I'm having trouble connecting right now. Please try again.";

/// Per-session tunables for the conversation orchestrator.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// System persona injected ahead of the remembered turns.
    pub persona: String,

    /// Maximum turns kept in session memory (FIFO eviction).
    pub max_turns: usize,

    /// Barge-in detection over inbound PCM frames.
    pub barge_in: BargeInConfig,

    /// Sentence-boundary chunking of the generation stream.
    pub chunking: ChunkerConfig,

    /// Bounded wait for the first byte of any adapter call.
    pub first_byte_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            persona: PERSONA.to_string(),
            max_turns: 20,
            barge_in: BargeInConfig::default(),
            chunking: ChunkerConfig::default(),
            first_byte_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    /// Build from environment, falling back to defaults per field.
    /// `MERAKI_MAX_TURNS`, `MERAKI_BARGE_IN_SUSTAIN_MS`,
    /// `MERAKI_BARGE_IN_RMS`, `MERAKI_FIRST_BYTE_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(n) = env_parse::<usize>("MERAKI_MAX_TURNS") {
            cfg.max_turns = n.max(1);
        }
        if let Some(ms) = env_parse::<u64>("MERAKI_BARGE_IN_SUSTAIN_MS") {
            cfg.barge_in.sustain_ms = ms;
        }
        if let Some(rms) = env_parse::<f32>("MERAKI_BARGE_IN_RMS") {
            cfg.barge_in.rms_threshold = rms;
        }
        if let Some(secs) = env_parse::<u64>("MERAKI_FIRST_BYTE_TIMEOUT_SECS") {
            cfg.first_byte_timeout = Duration::from_secs(secs.max(1));
        }
        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
