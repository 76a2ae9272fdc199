//! WebSocket session endpoint.
//!
//! Each accepted socket gets its own orchestrator session plus three provider
//! connections (transcription, generation, synthesis). Binary frames carry
//! microphone PCM; text frames carry JSON control messages one way and
//! session output the other.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use meraki_voice::llm::GeminiBackend;
use meraki_voice::stt::{spawn_transcriber, SttConfig};
use meraki_voice::tts::{MurfTts, TtsConfig};
use meraki_voice::{
    AgentResult, ClientMessage, NewsLookup, ServerMessage, Session, SessionConfig, SessionEvent,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub config: SessionConfig,
    /// Live sessions, cancel token per session for teardown.
    pub sessions: Arc<DashMap<Uuid, CancellationToken>>,
}

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "active_sessions": state.sessions.len(),
    }))
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

struct SessionWiring {
    session: Session,
    inbound_rx: mpsc::Receiver<SessionEvent>,
    events: mpsc::Sender<SessionEvent>,
    outbound_rx: mpsc::Receiver<ServerMessage>,
    cancel: CancellationToken,
}

/// Connect all three providers and assemble a session around them.
/// Any failure here means the session cannot open.
async fn wire_session(config: SessionConfig) -> AgentResult<SessionWiring> {
    let cancel = CancellationToken::new();
    let (events_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

    // One bounded first-byte/handshake wait across all three adapters.
    let (stt_tx, stt_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let mut stt_config = SttConfig::from_env()?;
    stt_config.connect_timeout = config.first_byte_timeout;
    spawn_transcriber(stt_config, stt_rx, events_tx.clone(), cancel.child_token());

    let generation = Arc::new(
        GeminiBackend::from_env()?.with_first_byte_timeout(config.first_byte_timeout),
    );
    let mut tts_config = TtsConfig::from_env()?;
    tts_config.first_byte_timeout = config.first_byte_timeout;
    let synthesis = Arc::new(
        MurfTts::connect(tts_config, events_tx.clone(), cancel.child_token()).await?,
    );
    let news = NewsLookup::from_env().ok();

    let session = Session::new(
        config,
        generation,
        synthesis,
        news,
        stt_tx,
        outbound_tx,
        events_tx.clone(),
        cancel.clone(),
    );
    Ok(SessionWiring {
        session,
        inbound_rx,
        events: events_tx,
        outbound_rx,
        cancel,
    })
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let wiring = match wire_session(state.config.clone()).await {
        Ok(w) => w,
        Err(e) => {
            warn!("Session setup failed: {}", e);
            let notice = ServerMessage::error(e.kind(), e.to_string());
            if let Ok(json) = serde_json::to_string(&notice) {
                let _ = sink.send(Message::Text(json)).await;
            }
            let _ = sink.close().await;
            return;
        }
    };

    let session_id = wiring.session.id();
    let cancel = wiring.cancel.clone();
    state.sessions.insert(session_id, cancel.clone());
    info!(session = %session_id, "WebSocket session opened");

    let session_task = tokio::spawn(wiring.session.run(wiring.inbound_rx));

    // Outbound pump: session messages become JSON text frames.
    let mut outbound_rx = wiring.outbound_rx;
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Dropping unserializable message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Inbound pump: binary is microphone PCM, text is a control message.
    let events = wiring.events;
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(session = %session_id, "WebSocket read error: {}", e);
                break;
            }
        };
        let event = match frame {
            Message::Binary(payload) => SessionEvent::AudioFrame(payload),
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Stop) => SessionEvent::Stop,
                Ok(ClientMessage::Reset) => SessionEvent::Reset,
                Err(e) => {
                    debug!(session = %session_id, "Ignoring malformed control message: {}", e);
                    continue;
                }
            },
            Message::Close(_) => break,
            // Axum answers pings itself.
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if events.send(event).await.is_err() {
            break;
        }
    }

    // Cancelling the session token ends the session loop and every provider
    // connection; the session drains nothing further once it fires.
    drop(events);
    cancel.cancel();
    let _ = session_task.await;
    writer.abort();
    state.sessions.remove(&session_id);
    info!(session = %session_id, "WebSocket session closed");
}
