//! Axum-based HTTP/WebSocket gateway.
//!
//! Routes:
//! - `GET /health`: liveness plus session and pacer counts
//! - `GET /api/sessions`: session summaries, most recent first
//! - `GET /api/sessions/{id}`: one session with its history log
//! - `GET /ingest`: speaker WebSocket (handshake, PCM frames, `EOF`)
//! - `GET /out/{session_id}/{target}`: listener WebSocket (metadata + audio)

use crate::config::Config;
use crate::voice::events::{IngestHandshake, EOF_SENTINEL};
use crate::voice::glossary::Glossary;
use crate::voice::openai_realtime::RealtimeTranscriber;
use crate::voice::pacer::{PacerContext, PacerRegistry};
use crate::voice::sessions::SessionDirectory;
use crate::voice::simul_session::{run_session, IngestContext, IngestFrame, IngestSettings};
use crate::voice::subscribers::{OutputConnection, SubscriberRegistry};
use crate::voice::translator::{AzureTranslator, RetryPolicy, TranslationGateway};
use crate::voice::tts::AzureSynthesizer;
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use futures_util::{future, SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::{Any, CorsLayer};

/// Queued outbound frames per listener before senders wait.
const OUTBOUND_QUEUE: usize = 32;

/// How often ended sessions are swept from the directory.
const SWEEP_INTERVAL_SECS: u64 = 60;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ingest: Arc<IngestContext>,
    pub subscribers: Arc<SubscriberRegistry>,
    pub pacers: Arc<PacerRegistry>,
    pub sessions: Arc<SessionDirectory>,
}

/// Wire the production adapters from configuration.
pub fn build_state(config: Config) -> Result<AppState> {
    let glossary = Arc::new(
        Glossary::load(&config.glossary.path).with_context(|| {
            format!("Failed to load glossary {}", config.glossary.path.display())
        })?,
    );
    if !glossary.is_empty() {
        tracing::info!(terms = glossary.len(), "Glossary loaded");
    }

    let translator = Arc::new(AzureTranslator::new(
        &config.translator.endpoint,
        &config.translator.key,
        Some(config.translator.region.as_str()).filter(|r| !r.is_empty()),
        config.translator.timeout_secs,
    ));
    let synthesizer = Arc::new(AzureSynthesizer::new(
        &config.speech.region,
        &config.speech.key,
        config.speech.streaming,
    ));
    let recognizer = Arc::new(RealtimeTranscriber::new(
        &config.recognizer.api_key,
        &config.recognizer.model,
        &config.recognizer.url,
    ));

    let subscribers = Arc::new(
        SubscriberRegistry::new(config.audio.output_sample_rate)
            .with_send_timeout(Duration::from_secs(config.gateway.send_timeout_secs)),
    );
    let pacer_ctx = Arc::new(PacerContext {
        synthesizer,
        subscribers: Arc::clone(&subscribers),
        voices: Arc::new(config.voice_table()?),
        playback: None,
        settings: config.pacer_settings(),
    });
    let pacers = Arc::new(PacerRegistry::new(config.pacer.scope, pacer_ctx));
    let sessions = SessionDirectory::shared(
        config.sessions.history_limit,
        Duration::from_secs(config.sessions.retention_secs),
    );

    let ingest = Arc::new(IngestContext {
        recognizer,
        translator: TranslationGateway::new(translator, glossary),
        pacers: Arc::clone(&pacers),
        sessions: Arc::clone(&sessions),
        settings: IngestSettings {
            sample_rate: config.audio.sample_rate,
            bytes_per_sample: config.audio.bytes_per_sample,
            segmentation: config.segmentation.resolve(),
            recv_tick: Duration::from_millis(config.segmentation.recv_tick_ms),
            retry: RetryPolicy {
                max_retries: config.translator.max_retries,
                ..RetryPolicy::default()
            },
        },
    });

    Ok(AppState {
        config: Arc::new(config),
        ingest,
        subscribers,
        pacers,
        sessions,
    })
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/sessions", get(handle_sessions_list))
        .route("/api/sessions/{id}", get(handle_session_get))
        .route("/ingest", get(handle_ingest_ws))
        .route("/out/{session_id}/{target}", get(handle_output_ws))
        .with_state(state)
        .layer(cors)
}

/// Run the relay until Ctrl-C.
pub async fn run_gateway(host: &str, port: u16, config: Config) -> Result<()> {
    let state = build_state(config)?;

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let actual_port = listener.local_addr()?.port();
    tracing::info!(
        host,
        port = actual_port,
        scope = ?state.pacers.scope(),
        "Interpretation relay listening"
    );

    let sessions = Arc::clone(&state.sessions);
    let sweeper = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let removed = sessions.sweep();
            if removed > 0 {
                tracing::debug!(removed, "Swept ended sessions");
            }
        }
    });

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    sweeper.abort();
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "ok",
        "sessions": state.sessions.live_count(),
        "pacers": state.pacers.len(),
    });
    Json(body)
}

/// GET /api/sessions
async fn handle_sessions_list(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "sessions": state.sessions.list() }))
}

/// GET /api/sessions/{id}
async fn handle_session_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.sessions.get(&id) {
        Some(record) => Json(record).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("Unknown session {id}") })),
        )
            .into_response(),
    }
}

// ── Ingest channel ───────────────────────────────────────────────

/// GET /ingest
async fn handle_ingest_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ingest_connection(socket, state))
}

/// Map one inbound WebSocket message onto the ingest stream; other text
/// frames are ignored.
fn ingest_frame(msg: Message) -> Option<IngestFrame> {
    match msg {
        Message::Binary(data) => Some(IngestFrame::Audio(data.to_vec())),
        Message::Text(text) if text.as_str().trim() == EOF_SENTINEL => Some(IngestFrame::Eof),
        _ => None,
    }
}

async fn handle_ingest_connection(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let handshake = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => break IngestHandshake::parse(text.as_str()),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                tracing::debug!("Speaker left before the handshake");
                return;
            }
            Some(Ok(_)) => {}
        }
    };
    let handshake = match handshake {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed ingest handshake");
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };

    let resolved = handshake.resolve(
        &state.config.sessions.default_source,
        &state.config.voices.default_target,
    );
    let session_id = resolved.session_id.clone();
    tracing::info!(
        session_id = %session_id,
        lang_src = %resolved.lang_src,
        targets = ?resolved.targets,
        "Speaker connected"
    );

    // The socket stream ends on close; a transport error ends it too.
    let inbound = ws_receiver
        .take_while(|msg| future::ready(msg.is_ok()))
        .filter_map(|msg| future::ready(msg.ok().and_then(ingest_frame)));

    if let Err(e) = run_session(Arc::clone(&state.ingest), resolved, Box::pin(inbound)).await {
        tracing::warn!(session_id = %session_id, error = %e, "Ingest session ended with error");
    }
    let _ = ws_sender.send(Message::Close(None)).await;
    tracing::debug!(session_id = %session_id, "Speaker WebSocket closed");
}

// ── Output channel ───────────────────────────────────────────────

type Outbound = (Message, oneshot::Sender<bool>);

/// Listener socket as seen by the registry. A writer task owns the sink;
/// each send waits for the writer's verdict.
struct WsOutputConnection {
    id: u64,
    tx: mpsc::Sender<Outbound>,
}

impl WsOutputConnection {
    async fn deliver(&self, msg: Message) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send((msg, ack_tx))
            .await
            .map_err(|_| anyhow::anyhow!("listener {} writer is gone", self.id))?;
        match ack_rx.await {
            Ok(true) => Ok(()),
            _ => anyhow::bail!("listener {} socket is closed", self.id),
        }
    }
}

#[async_trait]
impl OutputConnection for WsOutputConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.deliver(Message::Text(text.into())).await
    }

    async fn send_binary(&self, data: Vec<u8>) -> Result<()> {
        self.deliver(Message::Binary(data.into())).await
    }
}

/// GET /out/{session_id}/{target}
async fn handle_output_ws(
    State(state): State<AppState>,
    Path((session_id, target)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_output_connection(socket, state, session_id, target))
}

async fn handle_output_connection(
    socket: WebSocket,
    state: AppState,
    session_id: String,
    target: String,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);

    let send_task = tokio::spawn(async move {
        while let Some((msg, ack)) = rx.recv().await {
            let ok = ws_sender.send(msg).await.is_ok();
            let _ = ack.send(ok);
            if !ok {
                break;
            }
        }
    });

    let conn = Arc::new(WsOutputConnection {
        id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
        tx,
    });
    let conn_id = conn.id;

    if let Err(e) = state
        .subscribers
        .subscribe(&session_id, &target, conn)
        .await
    {
        tracing::debug!(session_id = %session_id, conn_id, error = %e, "Listener handshake failed");
        send_task.abort();
        return;
    }

    // Listener messages carry nothing; wait for the close.
    while let Some(Ok(msg)) = ws_receiver.next().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }

    state
        .subscribers
        .unsubscribe(&session_id, &target, conn_id)
        .await;
    send_task.abort();
    tracing::debug!(session_id = %session_id, target_lang = %target, conn_id, "Listener WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VoiceTable;
    use crate::voice::pacer::{PacerScope, PacerSettings};
    use crate::voice::sessions::{HistoryKind, SessionStatus};
    use crate::voice::test_support::{ChannelRecognizer, ScriptedSynthesizer, TableTranslator};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::collections::BTreeMap;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let config = Config::default();
        let subscribers = Arc::new(SubscriberRegistry::new(16_000));
        let voices = VoiceTable::new(
            "hi-IN",
            BTreeMap::from([("hi-IN".to_string(), "hi-IN-KavyaNeural".to_string())]),
        )
        .unwrap();
        let pacer_ctx = Arc::new(PacerContext {
            synthesizer: Arc::new(ScriptedSynthesizer::new(3_200)),
            subscribers: Arc::clone(&subscribers),
            voices: Arc::new(voices),
            playback: None,
            settings: PacerSettings::default(),
        });
        let pacers = Arc::new(PacerRegistry::new(PacerScope::Target, pacer_ctx));
        let sessions = SessionDirectory::shared(50, Duration::from_secs(3600));
        let ingest = Arc::new(IngestContext {
            recognizer: Arc::new(ChannelRecognizer::new()),
            translator: TranslationGateway::new(
                Arc::new(TableTranslator::default()),
                Arc::new(Glossary::empty()),
            ),
            pacers: Arc::clone(&pacers),
            sessions: Arc::clone(&sessions),
            settings: IngestSettings::default(),
        });
        AppState {
            config: Arc::new(config),
            ingest,
            subscribers,
            pacers,
            sessions,
        }
    }

    #[test]
    fn unreadable_glossary_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.glossary.path = dir.path().to_path_buf();

        let err = build_state(config).err().expect("a directory is not a glossary file");
        let message = format!("{err:#}");
        assert!(message.contains("Failed to load glossary"));
        assert!(message.contains(&dir.path().display().to_string()));
    }

    #[test]
    fn missing_glossary_builds_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.glossary.path = dir.path().join("absent.tsv");

        let state = build_state(config).unwrap();
        assert_eq!(state.subscribers.sample_rate(), 16_000);
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let payload = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&payload).unwrap())
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let state = test_state();
        state
            .sessions
            .open("S1", "en-US", &["hi-IN".to_string()])
            .unwrap();
        state.pacers.pacer_for("S1", "hi-IN");

        let (status, body) = get_json(build_router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 1);
        assert_eq!(body["pacers"], 1);
    }

    #[tokio::test]
    async fn sessions_list_and_detail() {
        let state = test_state();
        state
            .sessions
            .open("S1", "en-US", &["hi-IN".to_string()])
            .unwrap();
        state
            .sessions
            .record_event("S1", HistoryKind::Recognized, None, None, "Hello there.");
        state.sessions.close("S1", SessionStatus::Closed);

        let (status, body) = get_json(build_router(state.clone()), "/api/sessions").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessions"][0]["id"], "S1");
        assert_eq!(body["sessions"][0]["status"], "closed");
        assert!(body["sessions"][0].get("history").is_none());

        let (status, body) = get_json(build_router(state), "/api/sessions/S1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["history"][0]["text"], "Hello there.");
        assert_eq!(body["history"][0]["kind"], "recognized");
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (status, body) = get_json(build_router(test_state()), "/api/sessions/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[test]
    fn ingest_frames_map_from_messages() {
        assert_eq!(
            ingest_frame(Message::Binary(vec![1u8, 2].into())),
            Some(IngestFrame::Audio(vec![1, 2]))
        );
        assert_eq!(ingest_frame(Message::Text("EOF".into())), Some(IngestFrame::Eof));
        assert_eq!(ingest_frame(Message::Text(" EOF\n".into())), Some(IngestFrame::Eof));
        assert_eq!(ingest_frame(Message::Text("hello".into())), None);
        assert_eq!(ingest_frame(Message::Close(None)), None);
    }

    #[tokio::test]
    async fn output_connection_reports_closed_writer() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let conn = WsOutputConnection { id: 7, tx };
        assert!(conn.send_text("x".into()).await.is_err());
    }

    #[tokio::test]
    async fn output_connection_relays_writer_verdict() {
        let (tx, mut rx) = mpsc::channel::<Outbound>(1);
        let conn = WsOutputConnection { id: 8, tx };
        let writer = tokio::spawn(async move {
            let (_, ack) = rx.recv().await.unwrap();
            let _ = ack.send(true);
            let (_, ack) = rx.recv().await.unwrap();
            let _ = ack.send(false);
        });
        assert!(conn.send_binary(vec![0; 4]).await.is_ok());
        assert!(conn.send_binary(vec![0; 4]).await.is_err());
        writer.await.unwrap();
    }
}
