//! Error types for the voice conversation pipeline

use thiserror::Error;

/// Result type alias for voice pipeline operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that can occur while a conversation session is running.
///
/// The first five variants mirror the failure taxonomy the orchestrator
/// reacts to: transport loss tears the session down, transcription and
/// generation failures reset the turn, synthesis failures degrade to
/// text-only delivery, and tool failures are swallowed.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Client transport error: {0}")]
    Transport(String),

    #[error("Transcription error: {0}")]
    Transcription(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Stable kind string used in error notices sent over the transport.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Transport(_) => "transport",
            AgentError::Transcription(_) => "transcription",
            AgentError::Generation(_) => "generation",
            AgentError::Synthesis(_) => "synthesis",
            AgentError::Tool(_) => "tool",
            AgentError::Config(_) => "config",
            AgentError::Timeout(_) => "timeout",
            AgentError::ChannelSend(_) => "channel",
            AgentError::Io(_) => "io",
        }
    }

    /// Whether the session can keep running after this error.
    /// Only transport loss is fatal; everything else resets or degrades.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(AgentError::Transcription("x".into()).kind(), "transcription");
        assert_eq!(AgentError::Generation("x".into()).kind(), "generation");
        assert_eq!(AgentError::Synthesis("x".into()).kind(), "synthesis");
        assert_eq!(AgentError::Tool("x".into()).kind(), "tool");
    }

    #[test]
    fn only_transport_is_fatal() {
        assert!(AgentError::Transport("gone".into()).is_fatal());
        assert!(!AgentError::Synthesis("hiccup".into()).is_fatal());
    }
}
