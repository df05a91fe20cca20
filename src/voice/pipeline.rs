//! Pipeline value types and the seams to the external speech services.
//!
//! Every stage that talks to a provider (recognition, translation,
//! synthesis) is hidden behind a trait here so the orchestration layer
//! (ingest loop, dispatcher, pacers) can be driven by test doubles.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

// ── Value types ──────────────────────────────────────────────────

/// A finalized span of recognized text, cut by the segmentation policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub session_id: String,
    /// `{session_id}-{dispatch_epoch_ms}`, unique within the session.
    pub segment_id: String,
    pub text: String,
    /// Every target language this segment is translated into.
    pub targets: Vec<String>,
}

/// One translated segment waiting in a pacer queue.
#[derive(Debug, Clone)]
pub struct SynthesisJob {
    pub session_id: String,
    pub segment_id: String,
    pub target: String,
    /// Translated text to synthesize.
    pub text: String,
    pub enqueued_at: Instant,
}

impl SynthesisJob {
    pub fn new(segment: &Segment, target: &str, text: String) -> Self {
        Self {
            session_id: segment.session_id.clone(),
            segment_id: segment.segment_id.clone(),
            target: target.to_string(),
            text,
            enqueued_at: Instant::now(),
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────

/// Failure of a translation provider call. Never retried internally.
#[derive(Debug, thiserror::Error)]
pub enum TranslationError {
    #[error("translator returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected translator payload: {0}")]
    Payload(String),
    #[error("translator returned {actual} results for {expected} inputs")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("translator request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Failure of a speech synthesis call.
#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("unsupported synthesis sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),
    #[error("synthesizer returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("synthesis was canceled: {0}")]
    Canceled(String),
    #[error("synthesis request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Failure on the recognizer connection.
#[derive(Debug, thiserror::Error)]
pub enum RecognitionError {
    #[error("failed to connect recognizer: {0}")]
    Connect(String),
    #[error("recognizer stream closed")]
    Closed,
    #[error("failed to resample recognizer audio: {0}")]
    Resample(String),
}

// ── Speech recognition ───────────────────────────────────────────

/// Parameters for one continuous recognition run.
#[derive(Debug, Clone)]
pub struct RecognitionRequest {
    pub session_id: String,
    /// Source language, BCP-47 (e.g. `en-US`).
    pub language: String,
    /// Sample rate of the PCM16 mono audio that will be written.
    pub sample_rate: u32,
    /// Phrase hints biasing recognition toward known terms.
    pub phrases: Vec<String>,
}

/// A started recognition: the audio input half plus the ordered stream of
/// finalized text fragments produced by the recognizer's own task.
pub struct Recognition {
    pub input: Box<dyn RecognizerInput>,
    pub recognized: mpsc::UnboundedReceiver<String>,
}

/// Push-style audio input of a running recognition.
#[async_trait]
pub trait RecognizerInput: Send {
    /// Forward one PCM16 frame to the recognizer.
    async fn write(&mut self, pcm: &[u8]) -> Result<(), RecognitionError>;

    /// Stop continuous recognition. Idempotent.
    async fn stop(&mut self);
}

/// Continuous speech recognizer.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self, request: RecognitionRequest) -> anyhow::Result<Recognition>;
}

// ── Translation ──────────────────────────────────────────────────

/// Batch text translation. The output has the same length and order as
/// `texts`.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        texts: &[String],
        target: &str,
    ) -> Result<Vec<String>, TranslationError>;
}

// ── Speech synthesis ─────────────────────────────────────────────

/// Incremental PCM frames, terminated by the end of the stream.
pub type AudioFrames = BoxStream<'static, Result<Vec<u8>, SynthesisError>>;

/// What a synthesizer hands back: a whole clip or a frame stream.
pub enum SynthesisOutput {
    Complete(Vec<u8>),
    Frames(AudioFrames),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: String,
    /// Prosody rate (`medium`, `+10%`, ...).
    pub rate: String,
    pub sample_rate: u32,
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, request: &SynthesisRequest)
        -> Result<SynthesisOutput, SynthesisError>;
}

/// Local playback tap fed with each PCM frame as it is synthesized.
///
/// Integration point for embedding the relay next to an audio device. The
/// gateway ships no device sink and runs with `PacerContext::playback`
/// unset.
///
/// Called from the pacer worker, so implementations must hand the frame
/// off (e.g. to a device thread) instead of blocking.
pub trait PlaybackSink: Send + Sync {
    fn play(&self, pcm: &[u8]);
}

// ── Helpers ──────────────────────────────────────────────────────

/// Milliseconds since the Unix epoch.
pub fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Seconds since the Unix epoch, millisecond precision.
pub fn now_epoch_secs() -> f64 {
    now_epoch_ms() as f64 / 1000.0
}
