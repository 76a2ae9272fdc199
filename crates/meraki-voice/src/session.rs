//! **Conversation Orchestrator** — the per-session state machine.
//!
//! Three independently-paced adapter tasks (transcription, generation,
//! synthesis) push typed events onto one inbound queue; the session consumes
//! it one event at a time, so all session state is single-writer without
//! locking. Interruption cancels the in-flight response cooperatively and
//! drops its remaining events by response id, so nothing from a cancelled
//! response reaches the client after the transition back to listening.

use crate::chunker::{ChunkStrategy, SentenceChunker};
use crate::config::{SessionConfig, FALLBACK_TEXT};
use crate::error::AgentError;
use crate::llm::{GenerationBackend, GenerationChunk, GenerationRequest};
use crate::memory::{Role, SessionMemory};
use crate::news::{headlines_context, wants_headlines, NewsLookup};
use crate::protocol::ServerMessage;
use crate::stt::{SttCommand, TranscriptEvent, TranscriptKind};
use crate::tts::{SynthesisBackend, SynthesisChunk};
use crate::vad::BargeInDetector;
use base64::Engine;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Resting states of the conversation loop. Interruption is a transition
/// (cancel, discard, re-listen), not a state a session rests in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, nothing in flight.
    Idle,
    /// User audio is being transcribed.
    Listening,
    /// Final transcript received, generation in flight.
    Thinking,
    /// Synthesis audio is being relayed.
    Speaking,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
            SessionState::Thinking => "thinking",
            SessionState::Speaking => "speaking",
        };
        f.write_str(s)
    }
}

/// Fan-in event queue: everything the session reacts to, from every adapter
/// task and the client transport.
#[derive(Debug)]
pub enum SessionEvent {
    /// Raw PCM frame from the client.
    AudioFrame(Vec<u8>),
    /// Normalized transcript from the speech-to-text adapter.
    Transcript(TranscriptEvent),
    /// Speech-to-text is unrecoverable (reconnect already failed).
    TranscriptionFailed { message: String },
    /// Ordered generation fragment for response `id`.
    Generation { id: u64, chunk: GenerationChunk },
    /// Generation call failed or timed out before completing.
    GenerationFailed { id: u64, message: String },
    /// In-order audio for response `id`.
    Synthesis { id: u64, chunk: SynthesisChunk },
    /// All submitted units of response `id` have been delivered.
    SynthesisDone { id: u64 },
    /// Voice synthesis failed for response `id`.
    SynthesisFailed { id: u64, message: String },
    /// Client asked to finalize the current utterance now.
    Stop,
    /// Client asked to drop conversation memory and start over.
    Reset,
}

/// One conversation session. Owned by its event loop; created per client
/// connection and destroyed when the transport closes.
pub struct Session {
    id: Uuid,
    config: SessionConfig,
    state: SessionState,
    memory: SessionMemory,
    chunker: Box<dyn ChunkStrategy>,
    barge_in: BargeInDetector,

    generation: Arc<dyn GenerationBackend>,
    synthesis: Arc<dyn SynthesisBackend>,
    news: Option<NewsLookup>,

    stt: mpsc::Sender<SttCommand>,
    outbound: mpsc::Sender<ServerMessage>,
    /// Cloned into spawned generation tasks so their chunks land on the queue.
    events: mpsc::Sender<SessionEvent>,
    /// Session-root token; cancelled on teardown.
    cancel: CancellationToken,

    // Per-response bookkeeping. `active_response` is the id whose events are
    // currently accepted; anything else on the queue is stale and dropped.
    next_response_id: u64,
    active_response: Option<u64>,
    response_cancel: Option<CancellationToken>,
    response_text: String,
    submitted_units: u64,
    generation_done: bool,
    synthesis_failed: bool,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SessionConfig,
        generation: Arc<dyn GenerationBackend>,
        synthesis: Arc<dyn SynthesisBackend>,
        news: Option<NewsLookup>,
        stt: mpsc::Sender<SttCommand>,
        outbound: mpsc::Sender<ServerMessage>,
        events: mpsc::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let memory = SessionMemory::new(config.max_turns);
        let chunker = Box::new(SentenceChunker::new(config.chunking.clone()));
        let barge_in = BargeInDetector::new(config.barge_in.clone());
        Self {
            id: Uuid::new_v4(),
            config,
            state: SessionState::Idle,
            memory,
            chunker,
            barge_in,
            generation,
            synthesis,
            news,
            stt,
            outbound,
            events,
            cancel,
            next_response_id: 0,
            active_response: None,
            response_cancel: None,
            response_text: String::new(),
            submitted_units: 0,
            generation_done: false,
            synthesis_failed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn memory(&self) -> &SessionMemory {
        &self.memory
    }

    /// Consume the inbound queue until the session token is cancelled or the
    /// transport is gone, then close every open adapter connection. The
    /// session holds a sender to its own queue (for spawned generation
    /// tasks), so the queue alone never signals closure; the token does.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<SessionEvent>) {
        info!(session = %self.id, "session started");
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = inbound.recv() => match event {
                    Some(event) => {
                        if !self.handle_event(event).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        self.shutdown().await;
        info!(session = %self.id, "session ended");
    }

    /// Process one event. Returns false when the session must tear down
    /// (transport gone). Public so the state machine is drivable in tests.
    pub async fn handle_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::AudioFrame(frame) => self.on_audio_frame(frame).await,
            SessionEvent::Transcript(ev) => self.on_transcript(ev).await,
            SessionEvent::TranscriptionFailed { message } => {
                warn!(session = %self.id, "transcription failed: {}", message);
                self.abandon_response();
                self.set_state(SessionState::Idle);
                self.send_client(ServerMessage::error(
                    AgentError::Transcription(message.clone()).kind(),
                    format!("Speech recognition is unavailable: {message}"),
                ))
                .await
            }
            SessionEvent::Generation { id, chunk } => self.on_generation(id, chunk).await,
            SessionEvent::GenerationFailed { id, message } => {
                self.on_generation_failed(id, message).await
            }
            SessionEvent::Synthesis { id, chunk } => self.on_synthesis(id, chunk).await,
            SessionEvent::SynthesisDone { id } => self.on_synthesis_done(id).await,
            SessionEvent::SynthesisFailed { id, message } => {
                self.on_synthesis_failed(id, message).await
            }
            SessionEvent::Stop => {
                if self.state == SessionState::Listening {
                    debug!(session = %self.id, "stop: forcing transcript finalization");
                    let _ = self.stt.send(SttCommand::Finalize).await;
                }
                true
            }
            SessionEvent::Reset => {
                info!(session = %self.id, "reset: clearing conversation");
                self.abandon_response();
                self.memory.clear();
                self.barge_in.reset();
                self.set_state(SessionState::Idle);
                true
            }
        }
    }

    async fn on_audio_frame(&mut self, frame: Vec<u8>) -> bool {
        match self.state {
            SessionState::Idle => {
                self.set_state(SessionState::Listening);
                self.forward_audio(frame).await;
            }
            SessionState::Listening => {
                self.forward_audio(frame).await;
            }
            SessionState::Thinking | SessionState::Speaking => {
                // Only sustained voice activity counts as a deliberate
                // barge-in; transient noise is dropped on the floor.
                if self.barge_in.observe(&frame) {
                    self.interrupt();
                    self.forward_audio(frame).await;
                }
            }
        }
        true
    }

    async fn on_transcript(&mut self, event: TranscriptEvent) -> bool {
        match event.kind {
            TranscriptKind::Partial => {
                // Informational only: relayed for live display, never stored.
                self.send_client(ServerMessage::PartialTranscript { text: event.text })
                    .await
            }
            TranscriptKind::Final => {
                let text = event.text.trim().to_string();
                if text.is_empty() {
                    return true;
                }
                let turn = self.memory.append(Role::User, text.clone());
                info!(session = %self.id, seq = turn.seq, "user turn: {}", text);
                if !self
                    .send_client(ServerMessage::FinalTranscript { text: text.clone() })
                    .await
                {
                    return false;
                }
                self.set_state(SessionState::Thinking);
                self.barge_in.reset();
                self.start_generation(&text).await;
                true
            }
        }
    }

    async fn start_generation(&mut self, user_text: &str) {
        self.next_response_id += 1;
        let id = self.next_response_id;
        self.active_response = Some(id);
        self.response_text.clear();
        self.submitted_units = 0;
        self.generation_done = false;
        self.synthesis_failed = false;
        self.chunker.reset();

        // Optional tool context; failure degrades silently.
        let tool_context = if wants_headlines(user_text) {
            match &self.news {
                Some(news) => match news.top_headlines(5).await {
                    Ok(headlines) if !headlines.is_empty() => {
                        Some(headlines_context(&headlines))
                    }
                    Ok(_) => None,
                    Err(e) => {
                        debug!(session = %self.id, "news lookup failed, continuing without: {}", e);
                        None
                    }
                },
                None => None,
            }
        } else {
            None
        };

        let request = GenerationRequest {
            persona: self.config.persona.clone(),
            turns: self.memory.snapshot(),
            tool_context,
        };
        let cancel = self.cancel.child_token();
        self.response_cancel = Some(cancel.clone());

        let backend = Arc::clone(&self.generation);
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.stream(request, id, events.clone(), cancel).await {
                let _ = events
                    .send(SessionEvent::GenerationFailed {
                        id,
                        message: e.to_string(),
                    })
                    .await;
            }
        });
    }

    async fn on_generation(&mut self, id: u64, chunk: GenerationChunk) -> bool {
        if self.active_response != Some(id) {
            debug!(session = %self.id, "dropping stale generation chunk for response {}", id);
            return true;
        }
        if !chunk.done {
            self.response_text.push_str(&chunk.text);
            if !self
                .send_client(ServerMessage::AssistantChunk {
                    text: chunk.text.clone(),
                })
                .await
            {
                return false;
            }
            // Pipeline: every completed sentence goes to synthesis
            // immediately, before the full response exists.
            for unit in self.chunker.push(&chunk.text) {
                self.submit_unit(id, unit).await;
            }
            return true;
        }

        // End of response: flush the trailing partial sentence, then commit
        // the full reconstructed text as the assistant turn.
        if let Some(trailing) = self.chunker.flush() {
            self.submit_unit(id, trailing).await;
        }
        self.generation_done = true;
        let full_text = self.response_text.clone();
        let turn = self.memory.append(Role::Assistant, full_text.clone());
        info!(session = %self.id, seq = turn.seq, "assistant turn: {}", full_text);

        if self.submitted_units == 0 || self.synthesis_failed {
            // Nothing to play (empty response or degraded to text-only).
            return self.complete_turn(full_text).await;
        }
        if let Err(e) = self.synthesis.finish(id).await {
            warn!(session = %self.id, "synthesis finish failed: {}", e);
            return self.complete_turn(full_text).await;
        }
        true
    }

    async fn on_generation_failed(&mut self, id: u64, message: String) -> bool {
        if self.active_response != Some(id) {
            return true;
        }
        warn!(session = %self.id, "generation failed: {}", message);
        // No assistant turn for a failed response, even if some text streamed.
        self.abandon_response();
        self.set_state(SessionState::Idle);
        self.send_client(ServerMessage::error(
            AgentError::Generation(message).kind(),
            FALLBACK_TEXT,
        ))
        .await
    }

    async fn on_synthesis(&mut self, id: u64, chunk: SynthesisChunk) -> bool {
        if self.active_response != Some(id) || self.synthesis_failed {
            debug!(session = %self.id, "dropping stale synthesis chunk for response {}", id);
            return true;
        }
        if self.state == SessionState::Thinking {
            self.set_state(SessionState::Speaking);
        }
        let audio_base64 = base64::engine::general_purpose::STANDARD.encode(&chunk.audio);
        self.send_client(ServerMessage::AudioChunk {
            audio_base64,
            format: "mp3".to_string(),
        })
        .await
    }

    async fn on_synthesis_done(&mut self, id: u64) -> bool {
        if self.active_response != Some(id) {
            return true;
        }
        if !self.generation_done {
            // Audio drained but more generation chunks are pending; stay put.
            return true;
        }
        let full_text = self.response_text.clone();
        self.complete_turn(full_text).await
    }

    async fn on_synthesis_failed(&mut self, id: u64, message: String) -> bool {
        if self.active_response != Some(id) {
            return true;
        }
        warn!(session = %self.id, "synthesis failed, degrading to text-only: {}", message);
        self.synthesis_failed = true;
        self.synthesis.cancel(id);
        if !self
            .send_client(ServerMessage::error(
                AgentError::Synthesis(message).kind(),
                "Voice output is unavailable; continuing with text only.",
            ))
            .await
        {
            return false;
        }
        if self.generation_done {
            // Text already committed to memory; close the turn without audio.
            let full_text = self.response_text.clone();
            return self.complete_turn(full_text).await;
        }
        true
    }

    /// Barge-in: cancel the in-flight response, drop everything it buffered,
    /// and listen again. The cancelled response's remaining events are
    /// filtered out by id, so nothing of it is relayed past this point.
    fn interrupt(&mut self) {
        info!(session = %self.id, "barge-in: cancelling in-flight response");
        self.abandon_response();
        self.barge_in.reset();
        self.set_state(SessionState::Listening);
    }

    /// Cancel and forget the active response without touching memory.
    fn abandon_response(&mut self) {
        if let Some(token) = self.response_cancel.take() {
            token.cancel();
        }
        if let Some(id) = self.active_response.take() {
            self.synthesis.cancel(id);
        }
        self.chunker.reset();
        self.response_text.clear();
        self.submitted_units = 0;
        self.generation_done = false;
        self.synthesis_failed = false;
    }

    async fn complete_turn(&mut self, text: String) -> bool {
        self.active_response = None;
        self.response_cancel = None;
        self.set_state(SessionState::Idle);
        self.barge_in.reset();
        self.send_client(ServerMessage::TurnComplete { text }).await
    }

    async fn submit_unit(&mut self, id: u64, unit: String) {
        if self.synthesis_failed {
            return;
        }
        let index = self.submitted_units;
        self.submitted_units += 1;
        debug!(session = %self.id, index, "synthesis unit: {}", unit);
        if let Err(e) = self.synthesis.submit(id, index, unit).await {
            warn!(session = %self.id, "synthesis submit failed: {}", e);
            // Same degrade path as an async synthesis failure.
            self.synthesis_failed = true;
            self.synthesis.cancel(id);
            let _ = self
                .outbound
                .send(ServerMessage::error(
                    "synthesis",
                    "Voice output is unavailable; continuing with text only.",
                ))
                .await;
        }
    }

    async fn forward_audio(&mut self, frame: Vec<u8>) {
        if self.stt.send(SttCommand::Audio(frame)).await.is_err() {
            // Transcriber task is gone; it already reported the failure.
            debug!(session = %self.id, "audio frame dropped, transcriber closed");
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            debug!(session = %self.id, "state: {} -> {}", self.state, next);
            self.state = next;
        }
    }

    /// Relay one message to the client. False means the transport is gone,
    /// which is fatal to the session.
    async fn send_client(&mut self, message: ServerMessage) -> bool {
        if self.outbound.send(message).await.is_err() {
            warn!(session = %self.id, "client transport closed");
            return false;
        }
        true
    }

    async fn shutdown(&mut self) {
        self.abandon_response();
        self.cancel.cancel();
        let _ = self.stt.send(SttCommand::Close).await;
        self.set_state(SessionState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_render_lowercase() {
        assert_eq!(SessionState::Idle.to_string(), "idle");
        assert_eq!(SessionState::Speaking.to_string(), "speaking");
    }
}
