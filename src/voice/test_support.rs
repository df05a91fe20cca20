//! Test doubles shared by the voice unit tests.

use super::events::ClipMetadata;
use super::pipeline::{
    PlaybackSink, Recognition, RecognitionError, RecognitionRequest, RecognizerInput,
    SpeechRecognizer, SpeechSynthesizer, SynthesisError, SynthesisOutput, SynthesisRequest,
    TranslationError, Translator,
};
use super::subscribers::OutputConnection;
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Poll `cond` on the (possibly paused) tokio clock until it holds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

// ── Output connection ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text(String),
    Binary(Vec<u8>),
}

pub struct RecordingConnection {
    id: u64,
    sent: Mutex<Vec<Sent>>,
    failing: AtomicBool,
    /// Sends never complete while set, like a peer that stopped reading.
    stalled: AtomicBool,
    delay: Option<Duration>,
}

impl RecordingConnection {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            sent: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            delay: None,
        })
    }

    pub fn failing(id: u64) -> Arc<Self> {
        let conn = Self::new(id);
        conn.set_failing(true);
        conn
    }

    pub fn slow(id: u64, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id,
            sent: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            delay: Some(delay),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    /// Every clip metadata frame received so far.
    pub fn metadata(&self) -> Vec<ClipMetadata> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Text(t) => serde_json::from_str::<ClipMetadata>(t).ok(),
                Sent::Binary(_) => None,
            })
            .collect()
    }

    /// Every binary frame received so far.
    pub fn audio(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Binary(b) => Some(b.clone()),
                Sent::Text(_) => None,
            })
            .collect()
    }

    async fn record(&self, item: Sent) -> anyhow::Result<()> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("connection closed");
        }
        self.sent.lock().push(item);
        Ok(())
    }
}

#[async_trait]
impl OutputConnection for RecordingConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn send_text(&self, text: String) -> anyhow::Result<()> {
        self.record(Sent::Text(text)).await
    }

    async fn send_binary(&self, data: Vec<u8>) -> anyhow::Result<()> {
        self.record(Sent::Binary(data)).await
    }
}

// ── Synthesizer ────────────────────────────────────────────────────

/// Returns silence whose length is configured per text, recording when
/// each synthesis began.
pub struct ScriptedSynthesizer {
    lengths: HashMap<String, usize>,
    default_len: usize,
    /// Emit the clip as a stream of this many frames instead of one buffer.
    frames: Option<usize>,
    starts: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedSynthesizer {
    pub fn new(default_len: usize) -> Self {
        Self {
            lengths: HashMap::new(),
            default_len,
            frames: None,
            starts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_clip(mut self, text: &str, len: usize) -> Self {
        self.lengths.insert(text.to_string(), len);
        self
    }

    pub fn streaming(mut self, frames: usize) -> Self {
        self.frames = Some(frames.max(1));
        self
    }

    pub fn starts(&self) -> Vec<(String, Instant)> {
        self.starts.lock().clone()
    }

    pub fn start_of(&self, text: &str) -> Option<Instant> {
        self.starts
            .lock()
            .iter()
            .find(|(t, _)| t == text)
            .map(|(_, at)| *at)
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSynthesizer {
    async fn synthesize(
        &self,
        request: &SynthesisRequest,
    ) -> Result<SynthesisOutput, SynthesisError> {
        self.starts
            .lock()
            .push((request.text.clone(), Instant::now()));
        if request.text == "FAIL" {
            return Err(SynthesisError::Canceled("scripted failure".into()));
        }
        let len = self
            .lengths
            .get(&request.text)
            .copied()
            .unwrap_or(self.default_len);
        let pcm = vec![0u8; len];
        match self.frames {
            None => Ok(SynthesisOutput::Complete(pcm)),
            Some(n) => {
                let size = len.div_ceil(n).max(1);
                let chunks: Vec<Result<Vec<u8>, SynthesisError>> =
                    pcm.chunks(size).map(|c| Ok(c.to_vec())).collect();
                Ok(SynthesisOutput::Frames(
                    futures_util::stream::iter(chunks).boxed(),
                ))
            }
        }
    }
}

/// Counts the bytes handed to local playback.
#[derive(Default)]
pub struct CountingPlayback {
    pub frames: Mutex<Vec<usize>>,
}

impl PlaybackSink for CountingPlayback {
    fn play(&self, pcm: &[u8]) {
        self.frames.lock().push(pcm.len());
    }
}

// ── Translator ─────────────────────────────────────────────────────

/// Looks translations up in a table; unknown text is echoed, `FAIL`
/// errors.
#[derive(Default)]
pub struct TableTranslator {
    table: HashMap<(String, String), String>,
    pub calls: Mutex<Vec<(Vec<String>, String)>>,
}

impl TableTranslator {
    pub fn with(mut self, text: &str, target: &str, translated: &str) -> Self {
        self.table
            .insert((text.to_string(), target.to_string()), translated.to_string());
        self
    }
}

#[async_trait]
impl Translator for TableTranslator {
    async fn translate(
        &self,
        texts: &[String],
        target: &str,
    ) -> Result<Vec<String>, TranslationError> {
        self.calls.lock().push((texts.to_vec(), target.to_string()));
        texts
            .iter()
            .map(|t| {
                if t == "FAIL" {
                    return Err(TranslationError::Payload("scripted failure".into()));
                }
                Ok(self
                    .table
                    .get(&(t.clone(), target.to_string()))
                    .cloned()
                    .unwrap_or_else(|| t.clone()))
            })
            .collect()
    }
}

// ── Recognizer ─────────────────────────────────────────────────────

/// Recognizer whose fragments are pushed by the test through `feed`.
/// `close_feed` ends the recognized stream like a dropped provider socket.
pub struct ChannelRecognizer {
    feed: Mutex<Option<mpsc::UnboundedSender<String>>>,
    recognized: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    pub written: Arc<Mutex<Vec<u8>>>,
    pub stopped: Arc<AtomicBool>,
    pub requests: Mutex<Vec<RecognitionRequest>>,
}

impl ChannelRecognizer {
    pub fn new() -> Self {
        let (feed, recognized) = mpsc::unbounded_channel();
        Self {
            feed: Mutex::new(Some(feed)),
            recognized: Mutex::new(Some(recognized)),
            written: Arc::new(Mutex::new(Vec::new())),
            stopped: Arc::new(AtomicBool::new(false)),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn feed(&self) -> mpsc::UnboundedSender<String> {
        self.feed.lock().clone().expect("recognizer feed already closed")
    }

    pub fn close_feed(&self) {
        self.feed.lock().take();
    }
}

struct ChannelInput {
    written: Arc<Mutex<Vec<u8>>>,
    stopped: Arc<AtomicBool>,
}

#[async_trait]
impl RecognizerInput for ChannelInput {
    async fn write(&mut self, pcm: &[u8]) -> Result<(), RecognitionError> {
        self.written.lock().extend_from_slice(pcm);
        Ok(())
    }

    async fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SpeechRecognizer for ChannelRecognizer {
    fn name(&self) -> &str {
        "channel"
    }

    async fn start(&self, request: RecognitionRequest) -> anyhow::Result<Recognition> {
        self.requests.lock().push(request);
        let recognized = self
            .recognized
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("recognizer already started"))?;
        Ok(Recognition {
            input: Box::new(ChannelInput {
                written: Arc::clone(&self.written),
                stopped: Arc::clone(&self.stopped),
            }),
            recognized,
        })
    }
}
