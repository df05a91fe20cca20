//! OpenAI Realtime transcription client used as the speech recognizer.
//!
//! ## Protocol Overview
//!
//! 1. **Connect**: WebSocket to `wss://api.openai.com/v1/realtime?intent=transcription`
//! 2. **Setup**: send `transcription_session.update` with audio format,
//!    transcription model, phrase-hint prompt and server VAD
//! 3. **Stream**: send `input_audio_buffer.append` (Base64 PCM16 24kHz),
//!    receive `conversation.item.input_audio_transcription.completed`
//! 4. **Close**: gracefully close the WebSocket session

use async_trait::async_trait;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rubato::{FftFixedIn, Resampler};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::pipeline::{
    Recognition, RecognitionError, RecognitionRequest, RecognizerInput, SpeechRecognizer,
};

// ── Constants ──────────────────────────────────────────────────────

/// Realtime API audio: PCM16, 24kHz, mono.
pub const PROVIDER_SAMPLE_RATE: u32 = 24_000;

/// Resampler input block: 20 ms at 16 kHz.
const RESAMPLE_CHUNK_FRAMES: usize = 320;
const RESAMPLE_SUB_CHUNKS: usize = 2;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ── Outbound message ───────────────────────────────────────────────

#[derive(Debug)]
enum OutboundMessage {
    /// PCM16 at the provider rate.
    Audio(Vec<u8>),
    Close,
}

// ── Recognizer ─────────────────────────────────────────────────────

pub struct RealtimeTranscriber {
    api_key: String,
    model: String,
    url: String,
}

impl RealtimeTranscriber {
    pub fn new(api_key: &str, model: &str, url: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl SpeechRecognizer for RealtimeTranscriber {
    fn name(&self) -> &str {
        "openai-realtime"
    }

    async fn start(&self, request: RecognitionRequest) -> anyhow::Result<Recognition> {
        if self.api_key.is_empty() {
            anyhow::bail!("OpenAI API key is not configured");
        }
        let resampler = Pcm16Resampler::new(request.sample_rate, PROVIDER_SAMPLE_RATE)?;

        tracing::info!(
            session_id = %request.session_id,
            model = %self.model,
            language = %request.language,
            phrases = request.phrases.len(),
            "Connecting realtime transcription"
        );

        let mut ws_request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RecognitionError::Connect(format!("bad request: {e}")))?;
        ws_request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.api_key)
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid auth header: {e}"))?,
        );
        ws_request.headers_mut().insert(
            "OpenAI-Beta",
            "realtime=v1"
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid header: {e}"))?,
        );

        let (ws_stream, _response) = tokio_tungstenite::connect_async(ws_request)
            .await
            .map_err(|e| RecognitionError::Connect(e.to_string()))?;
        let (mut ws_sender, ws_receiver) = ws_stream.split();

        let update = build_session_update(&self.model, &request);
        ws_sender
            .send(WsMessage::Text(serde_json::to_string(&update)?.into()))
            .await
            .map_err(|e| RecognitionError::Connect(format!("session update: {e}")))?;

        let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundMessage>(256);
        let (recognized_tx, recognized_rx) = mpsc::unbounded_channel::<String>();

        let sid_out = request.session_id.clone();
        tokio::spawn(async move {
            outbound_loop(outbound_rx, ws_sender, sid_out).await;
        });
        let sid_in = request.session_id.clone();
        tokio::spawn(async move {
            inbound_loop(ws_receiver, recognized_tx, sid_in).await;
        });

        Ok(Recognition {
            input: Box::new(RealtimeInput {
                outbound_tx,
                resampler,
                stopped: false,
            }),
            recognized: recognized_rx,
        })
    }
}

struct RealtimeInput {
    outbound_tx: mpsc::Sender<OutboundMessage>,
    resampler: Pcm16Resampler,
    stopped: bool,
}

#[async_trait]
impl RecognizerInput for RealtimeInput {
    async fn write(&mut self, pcm: &[u8]) -> Result<(), RecognitionError> {
        if self.stopped {
            return Err(RecognitionError::Closed);
        }
        let resampled = self.resampler.process(pcm)?;
        if resampled.is_empty() {
            return Ok(());
        }
        self.outbound_tx
            .send(OutboundMessage::Audio(resampled))
            .await
            .map_err(|_| RecognitionError::Closed)
    }

    async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        match self.resampler.flush() {
            Ok(tail) if !tail.is_empty() => {
                let _ = self.outbound_tx.send(OutboundMessage::Audio(tail)).await;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Dropping unresampled audio tail"),
        }
        let _ = self.outbound_tx.send(OutboundMessage::Close).await;
    }
}

// ── Internal loops ─────────────────────────────────────────────────

async fn outbound_loop(
    mut rx: mpsc::Receiver<OutboundMessage>,
    mut ws_sender: SplitSink<WsStream, WsMessage>,
    session_id: String,
) {
    let mut audio_chunk_count: u64 = 0;

    while let Some(msg) = rx.recv().await {
        match msg {
            OutboundMessage::Audio(pcm) => {
                audio_chunk_count += 1;
                let msg = serde_json::json!({
                    "type": "input_audio_buffer.append",
                    "audio": base64::engine::general_purpose::STANDARD.encode(&pcm),
                });
                if audio_chunk_count == 1 || audio_chunk_count.is_multiple_of(200) {
                    tracing::debug!(
                        session_id = %session_id,
                        chunk = audio_chunk_count,
                        pcm_bytes = pcm.len(),
                        "Sending audio to realtime transcription"
                    );
                }
                if ws_sender
                    .send(WsMessage::Text(msg.to_string().into()))
                    .await
                    .is_err()
                {
                    tracing::warn!(
                        session_id = %session_id,
                        "WebSocket send failed, closing outbound loop"
                    );
                    break;
                }
            }
            OutboundMessage::Close => {
                let _ = ws_sender.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }

    tracing::debug!(session_id = %session_id, "Realtime outbound loop terminated");
}

async fn inbound_loop(
    mut ws_receiver: SplitStream<WsStream>,
    recognized_tx: mpsc::UnboundedSender<String>,
    session_id: String,
) {
    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(WsMessage::Text(text)) => match parse_server_event(&text) {
                ServerEvent::Transcript(transcript) => {
                    if recognized_tx.send(transcript).is_err() {
                        tracing::debug!(
                            session_id = %session_id,
                            "Recognized receiver dropped, closing inbound loop"
                        );
                        return;
                    }
                }
                ServerEvent::Error(message) => {
                    tracing::error!(
                        session_id = %session_id,
                        error = %message,
                        "Realtime transcription error"
                    );
                }
                ServerEvent::Ready => {
                    tracing::info!(session_id = %session_id, "Realtime transcription ready");
                }
                ServerEvent::Other(event_type) => {
                    tracing::trace!(
                        session_id = %session_id,
                        event_type = %event_type,
                        "Realtime event (unhandled)"
                    );
                }
            },
            Ok(WsMessage::Close(frame)) => {
                tracing::info!(
                    session_id = %session_id,
                    close_frame = ?frame,
                    "Realtime transcription connection closed"
                );
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(
                    session_id = %session_id,
                    error = %e,
                    "Realtime transcription WebSocket error"
                );
                break;
            }
        }
    }

    tracing::debug!(session_id = %session_id, "Realtime inbound loop terminated");
}

// ── Session update message ─────────────────────────────────────────

/// ISO-639-1 part of a BCP-47 tag (`en-US` → `en`).
fn primary_language(tag: &str) -> &str {
    tag.split(['-', '_']).next().unwrap_or(tag)
}

fn build_session_update(model: &str, request: &RecognitionRequest) -> serde_json::Value {
    let mut transcription = serde_json::json!({
        "model": model,
        "language": primary_language(&request.language),
    });
    if !request.phrases.is_empty() {
        transcription["prompt"] = serde_json::Value::String(request.phrases.join(", "));
    }

    serde_json::json!({
        "type": "transcription_session.update",
        "session": {
            "input_audio_format": "pcm16",
            "input_audio_transcription": transcription,
            "turn_detection": {
                "type": "server_vad",
                "silence_duration_ms": 500
            }
        }
    })
}

// ── Server event parsing ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum ServerEvent {
    Ready,
    /// Finalized, non-empty transcript of one turn.
    Transcript(String),
    Error(String),
    Other(String),
}

fn parse_server_event(json_text: &str) -> ServerEvent {
    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => return ServerEvent::Error(format!("Failed to parse realtime event: {e}")),
    };
    let event_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match event_type {
        "transcription_session.created" | "transcription_session.updated" => ServerEvent::Ready,
        "conversation.item.input_audio_transcription.completed" => {
            let transcript = value
                .get("transcript")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim();
            if transcript.is_empty() {
                ServerEvent::Other(event_type.to_string())
            } else {
                ServerEvent::Transcript(transcript.to_string())
            }
        }
        "error" => ServerEvent::Error(
            value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown realtime error")
                .to_string(),
        ),
        other => ServerEvent::Other(other.to_string()),
    }
}

// ── Resampling ─────────────────────────────────────────────────────

/// Streaming PCM16LE mono rate converter.
///
/// Input arrives in arbitrary byte slices. A trailing odd byte is held
/// until the next slice completes the sample, and samples are fed to the
/// resampler in fixed blocks so filter state carries across writes.
pub struct Pcm16Resampler {
    /// `None` when the rates match and bytes pass through.
    resampler: Option<FftFixedIn<f32>>,
    from_rate: u32,
    to_rate: u32,
    carry: Option<u8>,
    pending: Vec<f32>,
}

impl Pcm16Resampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, RecognitionError> {
        if from_rate == 0 || to_rate == 0 {
            return Err(RecognitionError::Resample(format!(
                "invalid sample rates {from_rate} -> {to_rate}"
            )));
        }
        let resampler = if from_rate == to_rate {
            None
        } else {
            Some(
                FftFixedIn::<f32>::new(
                    from_rate as usize,
                    to_rate as usize,
                    RESAMPLE_CHUNK_FRAMES,
                    RESAMPLE_SUB_CHUNKS,
                    1,
                )
                .map_err(|e| RecognitionError::Resample(e.to_string()))?,
            )
        };
        Ok(Self {
            resampler,
            from_rate,
            to_rate,
            carry: None,
            pending: Vec::new(),
        })
    }

    /// Convert the next slice of input. Returns whatever whole output
    /// blocks are ready, possibly nothing.
    pub fn process(&mut self, pcm: &[u8]) -> Result<Vec<u8>, RecognitionError> {
        let mut bytes = Vec::with_capacity(pcm.len() + 1);
        bytes.extend(self.carry.take());
        bytes.extend_from_slice(pcm);
        if bytes.len() % 2 == 1 {
            self.carry = bytes.pop();
        }

        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(bytes);
        };
        self.pending.extend(
            bytes
                .chunks_exact(2)
                .map(|c| f32::from(i16::from_le_bytes([c[0], c[1]])) / 32_768.0),
        );

        let mut out = Vec::new();
        while self.pending.len() >= resampler.input_frames_next() {
            let block: Vec<f32> = self
                .pending
                .drain(..resampler.input_frames_next())
                .collect();
            let frames = resampler
                .process(&[block], None)
                .map_err(|e| RecognitionError::Resample(e.to_string()))?;
            push_pcm16(&mut out, &frames[0]);
        }
        Ok(out)
    }

    /// Resample the samples still short of a full block. A dangling odd
    /// byte is discarded.
    pub fn flush(&mut self) -> Result<Vec<u8>, RecognitionError> {
        self.carry = None;
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Vec::new());
        };
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let rest = std::mem::take(&mut self.pending);
        let expected =
            (rest.len() as u64 * u64::from(self.to_rate) / u64::from(self.from_rate)) as usize;
        let block = vec![rest];
        let frames = resampler
            .process_partial(Some(block.as_slice()), None)
            .map_err(|e| RecognitionError::Resample(e.to_string()))?;
        let produced = &frames[0];
        let mut out = Vec::with_capacity(expected * 2);
        push_pcm16(&mut out, &produced[..expected.min(produced.len())]);
        Ok(out)
    }
}

fn push_pcm16(out: &mut Vec<u8>, samples: &[f32]) {
    for sample in samples {
        let value = (sample * 32_768.0)
            .round()
            .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
}

// ── Tests ──────────────────────────────────────────────────────────
