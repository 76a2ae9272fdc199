//! **Synthesis Stream Adapter** — text units in submission order, audio
//! chunks back in the same order.
//!
//! The underlying provider protocol may acknowledge submissions out of order,
//! so every outgoing unit is tagged with its submission index and incoming
//! audio is held in a reorder buffer until its predecessors have been
//! released. Cancellation drops any unit submitted afterwards without a
//! network call.

use crate::error::{AgentError, AgentResult};
use crate::session::SessionEvent;
use async_trait::async_trait;
use base64::Engine;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One audio payload tied to the text unit that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisChunk {
    /// Submission index of the originating text unit.
    pub index: u64,
    /// Encoded audio bytes (provider format, mp3 by default).
    pub audio: Vec<u8>,
}

/// Releases audio chunks strictly in submission-index order, no matter the
/// order the provider returns them.
#[derive(Debug, Default)]
pub struct ReorderBuffer {
    next_index: u64,
    pending: BTreeMap<u64, SynthesisChunk>,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one provider chunk; returns every chunk now releasable, in order.
    pub fn accept(&mut self, chunk: SynthesisChunk) -> Vec<SynthesisChunk> {
        if chunk.index < self.next_index {
            // Duplicate or already-released index; drop rather than reorder backwards.
            return Vec::new();
        }
        self.pending.insert(chunk.index, chunk);
        let mut released = Vec::new();
        while let Some(chunk) = self.pending.remove(&self.next_index) {
            self.next_index += 1;
            released.push(chunk);
        }
        released
    }

    /// Number of chunks released so far.
    pub fn released(&self) -> u64 {
        self.next_index
    }

    /// True when nothing is parked waiting for a predecessor.
    pub fn is_drained(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.next_index = 0;
    }
}

/// Seam for the voice-synthesis connection. One response is in flight at a
/// time; submissions carry the response id so late text after a cancellation
/// can be dropped without touching the network.
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    /// Submit one text unit. `index` is the submission order within the response.
    async fn submit(&self, response_id: u64, index: u64, text: String) -> AgentResult<()>;

    /// No more units for this response; emit `SynthesisDone` once all audio
    /// has been delivered.
    async fn finish(&self, response_id: u64) -> AgentResult<()>;

    /// Cancel the response: pending and future submissions for it are dropped.
    fn cancel(&self, response_id: u64);
}

#[derive(Debug)]
enum TtsCommand {
    Submit {
        response_id: u64,
        index: u64,
        text: String,
    },
    Finish {
        response_id: u64,
    },
    Cancel {
        response_id: u64,
    },
}

/// Configuration for the streaming synthesis connection.
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub endpoint: String,
    pub api_key: String,
    pub voice_id: String,
    /// Static context id so the provider reuses one synthesis context
    /// instead of hitting its per-connection context limit.
    pub context_id: String,
    /// Bounded wait between a response's first submission and its first
    /// audio frame; expiry fails the response instead of hanging it.
    pub first_byte_timeout: Duration,
}

impl TtsConfig {
    /// Build from environment: `MURF_API_KEY` (required), `MURF_WS_URL` and
    /// `MURF_VOICE_ID` (optional overrides).
    pub fn from_env() -> AgentResult<Self> {
        let api_key = std::env::var("MURF_API_KEY")
            .map_err(|_| AgentError::Config("MURF_API_KEY not set".to_string()))?;
        let endpoint = std::env::var("MURF_WS_URL")
            .unwrap_or_else(|_| "wss://api.murf.ai/v1/speech/generate-stream".to_string());
        let voice_id =
            std::env::var("MURF_VOICE_ID").unwrap_or_else(|_| "en-US-natalie".to_string());
        Ok(Self {
            endpoint,
            api_key,
            voice_id,
            context_id: "meraki-streaming-context".to_string(),
            first_byte_timeout: Duration::from_secs(10),
        })
    }
}

/// Production synthesis adapter over a persistent provider WebSocket.
pub struct MurfTts {
    commands: mpsc::UnboundedSender<TtsCommand>,
}

impl MurfTts {
    /// Connect and spawn the socket task; audio chunks and completion/failure
    /// signals arrive on the session queue.
    pub async fn connect(
        config: TtsConfig,
        events: mpsc::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) -> AgentResult<Self> {
        let mut request = config
            .endpoint
            .clone()
            .into_client_request()
            .map_err(|e| AgentError::Synthesis(e.to_string()))?;
        request.headers_mut().insert(
            "api-key",
            config
                .api_key
                .parse()
                .map_err(|_| AgentError::Config("API key is not a valid header value".to_string()))?,
        );
        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| AgentError::Synthesis(format!("connect failed: {e}")))?;
        info!("Synthesis connected ({})", config.endpoint);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(socket_task(config, ws, command_rx, events, cancel));
        Ok(Self {
            commands: command_tx,
        })
    }
}

#[async_trait]
impl SynthesisBackend for MurfTts {
    async fn submit(&self, response_id: u64, index: u64, text: String) -> AgentResult<()> {
        self.commands
            .send(TtsCommand::Submit {
                response_id,
                index,
                text,
            })
            .map_err(|e| AgentError::ChannelSend(e.to_string()))
    }

    async fn finish(&self, response_id: u64) -> AgentResult<()> {
        self.commands
            .send(TtsCommand::Finish { response_id })
            .map_err(|e| AgentError::ChannelSend(e.to_string()))
    }

    fn cancel(&self, response_id: u64) {
        let _ = self.commands.send(TtsCommand::Cancel { response_id });
    }
}

/// State of the single in-flight response on the socket.
#[derive(Debug, Default)]
struct ResponseState {
    response_id: u64,
    reorder: ReorderBuffer,
    submitted: u64,
    finished: bool,
}

/// Maps provider-echoed wire indices back to (response, unit). Wire indices
/// increase across the whole connection and are never reused, so a frame
/// already in flight for a cancelled response can never alias a unit of the
/// next response.
#[derive(Debug, Default)]
struct UnitLedger {
    next_wire_index: u64,
    pending: HashMap<u64, (u64, u64)>,
}

impl UnitLedger {
    /// Mint the wire index for one submitted unit.
    fn issue(&mut self, response_id: u64, unit_index: u64) -> u64 {
        let wire = self.next_wire_index;
        self.next_wire_index += 1;
        self.pending.insert(wire, (response_id, unit_index));
        wire
    }

    /// Attribute an incoming frame; each wire index resolves at most once.
    fn resolve(&mut self, wire_index: u64) -> Option<(u64, u64)> {
        self.pending.remove(&wire_index)
    }

    /// Drop every outstanding unit of responses up to and including `response_id`.
    fn forget_through(&mut self, response_id: u64) {
        self.pending.retain(|_, unit| unit.0 > response_id);
    }
}

/// Pending-deadline future for the select loop; never resolves when unarmed.
async fn first_audio_stall(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn socket_task<S>(
    config: TtsConfig,
    mut ws: S,
    mut commands: mpsc::UnboundedReceiver<TtsCommand>,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) where
    S: Sink<WsMessage> + Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    let mut active: Option<ResponseState> = None;
    // Responses at or below this id have been cancelled; their submissions
    // are dropped here, before any network write.
    let mut cancelled_through: Option<u64> = None;
    let mut ledger = UnitLedger::default();
    // Armed between a response's first submit and its first audio frame.
    let mut first_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws.close().await;
                return;
            }
            _ = first_audio_stall(first_deadline) => {
                first_deadline = None;
                if let Some(state) = active.take() {
                    warn!(
                        "Synthesis produced no audio within {:?}",
                        config.first_byte_timeout
                    );
                    fail(&events, state.response_id, "no audio before the first-audio deadline")
                        .await;
                }
            }
            cmd = commands.recv() => match cmd {
                Some(TtsCommand::Submit { response_id, index, text }) => {
                    if cancelled_through.is_some_and(|c| response_id <= c) {
                        debug!("dropping post-cancel synthesis unit {} of response {}", index, response_id);
                        continue;
                    }
                    match active {
                        Some(ref mut state) if state.response_id == response_id => {
                            state.submitted = state.submitted.max(index + 1);
                        }
                        _ => {
                            active = Some(ResponseState {
                                response_id,
                                reorder: ReorderBuffer::new(),
                                submitted: index + 1,
                                finished: false,
                            });
                            first_deadline = Some(Instant::now() + config.first_byte_timeout);
                        }
                    }
                    let wire_index = ledger.issue(response_id, index);
                    let payload = serde_json::json!({
                        "context_id": config.context_id,
                        "voice_id": config.voice_id,
                        "format": "MP3",
                        "text": text,
                        "chunk_index": wire_index,
                        "end": false,
                    });
                    if ws.send(WsMessage::Text(payload.to_string())).await.is_err() {
                        fail(&events, response_id, "synthesis socket write failed").await;
                        return;
                    }
                }
                Some(TtsCommand::Finish { response_id }) => {
                    if cancelled_through.is_some_and(|c| response_id <= c) {
                        continue;
                    }
                    if let Some(ref mut state) = active {
                        if state.response_id == response_id {
                            state.finished = true;
                            let payload = serde_json::json!({
                                "context_id": config.context_id,
                                "end": true,
                            });
                            let _ = ws.send(WsMessage::Text(payload.to_string())).await;
                            if state.reorder.released() >= state.submitted {
                                let done = state.response_id;
                                active = None;
                                first_deadline = None;
                                let _ = events.send(SessionEvent::SynthesisDone { id: done }).await;
                            }
                        }
                    }
                }
                Some(TtsCommand::Cancel { response_id }) => {
                    cancelled_through =
                        Some(cancelled_through.map_or(response_id, |c| c.max(response_id)));
                    ledger.forget_through(response_id);
                    if active.as_ref().is_some_and(|s| s.response_id <= response_id) {
                        active = None;
                        first_deadline = None;
                    }
                    let payload = serde_json::json!({
                        "context_id": config.context_id,
                        "clear": true,
                    });
                    let _ = ws.send(WsMessage::Text(payload.to_string())).await;
                }
                None => {
                    let _ = ws.close().await;
                    return;
                }
            },
            frame = ws.next() => match frame {
                Some(Ok(WsMessage::Text(raw))) => {
                    match parse_provider_audio(&raw) {
                        Ok(Some(wire)) => {
                            let Some((response_id, unit_index)) = ledger.resolve(wire.index) else {
                                debug!("dropping unattributable synthesis frame {}", wire.index);
                                continue;
                            };
                            if cancelled_through.is_some_and(|c| response_id <= c) {
                                debug!("dropping audio of cancelled response {}", response_id);
                                continue;
                            }
                            let Some(ref mut state) = active else { continue };
                            if state.response_id != response_id {
                                continue;
                            }
                            first_deadline = None;
                            let chunk = SynthesisChunk { index: unit_index, audio: wire.audio };
                            for released in state.reorder.accept(chunk) {
                                let _ = events
                                    .send(SessionEvent::Synthesis {
                                        id: response_id,
                                        chunk: released,
                                    })
                                    .await;
                            }
                            if state.finished && state.reorder.released() >= state.submitted {
                                active = None;
                                let _ = events.send(SessionEvent::SynthesisDone { id: response_id }).await;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            first_deadline = None;
                            if let Some(state) = active.take() {
                                fail(&events, state.response_id, &e.to_string()).await;
                            }
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    warn!("Synthesis upstream closed");
                    if let Some(state) = active.take() {
                        fail(&events, state.response_id, "synthesis stream closed mid-response").await;
                    }
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Synthesis upstream error: {}", e);
                    if let Some(state) = active.take() {
                        fail(&events, state.response_id, &e.to_string()).await;
                    }
                    return;
                }
            },
        }
    }
}

async fn fail(events: &mpsc::Sender<SessionEvent>, response_id: u64, message: &str) {
    let _ = events
        .send(SessionEvent::SynthesisFailed {
            id: response_id,
            message: message.to_string(),
        })
        .await;
}

/// Normalize one provider message into an audio chunk. Housekeeping acks
/// yield `None`; an explicit provider error yields `Err`.
fn parse_provider_audio(raw: &str) -> AgentResult<Option<SynthesisChunk>> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| AgentError::Synthesis(e.to_string()))?;
    if let Some(err) = value.get("error").and_then(|e| e.as_str()) {
        return Err(AgentError::Synthesis(err.to_string()));
    }
    let Some(audio_b64) = value.get("audio").and_then(|a| a.as_str()) else {
        return Ok(None);
    };
    // Unattributable audio is unusable; the echoed index is the attribution.
    let Some(index) = value.get("chunk_index").and_then(|i| i.as_u64()) else {
        return Ok(None);
    };
    let audio = base64::engine::general_purpose::STANDARD
        .decode(audio_b64)
        .map_err(|e| AgentError::Synthesis(format!("bad audio payload: {e}")))?;
    Ok(Some(SynthesisChunk { index, audio }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: u64) -> SynthesisChunk {
        SynthesisChunk {
            index,
            audio: vec![index as u8],
        }
    }

    #[test]
    fn in_order_arrival_releases_immediately() {
        let mut buf = ReorderBuffer::new();
        assert_eq!(buf.accept(chunk(0)).len(), 1);
        assert_eq!(buf.accept(chunk(1)).len(), 1);
        assert_eq!(buf.released(), 2);
        assert!(buf.is_drained());
    }

    #[test]
    fn out_of_order_arrival_is_restored() {
        let mut buf = ReorderBuffer::new();
        assert!(buf.accept(chunk(2)).is_empty());
        assert!(buf.accept(chunk(1)).is_empty());
        let released = buf.accept(chunk(0));
        let indices: Vec<u64> = released.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(buf.is_drained());
    }

    #[test]
    fn shuffled_arrival_always_releases_in_submission_order() {
        let arrival = [3u64, 0, 4, 1, 2, 5];
        let mut buf = ReorderBuffer::new();
        let mut released = Vec::new();
        for &i in &arrival {
            released.extend(buf.accept(chunk(i)).into_iter().map(|c| c.index));
        }
        assert_eq!(released, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn duplicate_indices_are_dropped() {
        let mut buf = ReorderBuffer::new();
        buf.accept(chunk(0));
        assert!(buf.accept(chunk(0)).is_empty());
        assert_eq!(buf.released(), 1);
    }

    #[test]
    fn provider_audio_parsing() {
        let ok = parse_provider_audio(r#"{"audio":"AQID","chunk_index":2,"final":false}"#)
            .unwrap()
            .unwrap();
        assert_eq!(ok.index, 2);
        assert_eq!(ok.audio, vec![1, 2, 3]);

        // Housekeeping ack without audio.
        assert!(parse_provider_audio(r#"{"context_id":"x","status":"ok"}"#)
            .unwrap()
            .is_none());

        // Audio without an echoed index cannot be attributed to a unit.
        assert!(parse_provider_audio(r#"{"audio":"AQID"}"#).unwrap().is_none());

        // Provider-reported failure.
        assert!(parse_provider_audio(r#"{"error":"voice not found"}"#).is_err());
    }

    #[test]
    fn wire_indices_are_unique_across_responses() {
        let mut ledger = UnitLedger::default();
        let a = ledger.issue(1, 0);
        let b = ledger.issue(1, 1);
        let c = ledger.issue(2, 0);
        assert!(a < b && b < c);
        assert_eq!(ledger.resolve(c), Some((2, 0)));
        assert_eq!(ledger.resolve(a), Some((1, 0)));
        // Each wire index resolves once.
        assert_eq!(ledger.resolve(a), None);
    }

    #[test]
    fn late_frames_of_a_cancelled_response_resolve_to_nothing() {
        let mut ledger = UnitLedger::default();
        let old = ledger.issue(1, 0);
        ledger.forget_through(1);
        let new = ledger.issue(2, 0);
        // The cancelled unit's frame cannot be mistaken for the new response's
        // first chunk even though both are its response's unit 0.
        assert_eq!(ledger.resolve(old), None);
        assert_eq!(ledger.resolve(new), Some((2, 0)));
    }

    /// Accepts every write and never produces a frame.
    struct StallingSocket;

    impl Stream for StallingSocket {
        type Item = Result<WsMessage, WsError>;

        fn poll_next(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Option<Self::Item>> {
            std::task::Poll::Pending
        }
    }

    impl Sink<WsMessage> for StallingSocket {
        type Error = WsError;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn start_send(self: std::pin::Pin<&mut Self>, _item: WsMessage) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn stalled_provider_fails_the_response() {
        let config = TtsConfig {
            endpoint: "wss://example.invalid".to_string(),
            api_key: "test".to_string(),
            voice_id: "en-US-natalie".to_string(),
            context_id: "test-context".to_string(),
            first_byte_timeout: Duration::from_millis(50),
        };
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(socket_task(
            config,
            StallingSocket,
            command_rx,
            events_tx,
            CancellationToken::new(),
        ));

        command_tx
            .send(TtsCommand::Submit {
                response_id: 1,
                index: 0,
                text: "Hello.".to_string(),
            })
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .expect("stall must surface before the test deadline")
            .expect("events channel open");
        assert!(matches!(event, SessionEvent::SynthesisFailed { id: 1, .. }));
    }
}
