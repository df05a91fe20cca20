//! Per-speaker ingest loop.
//!
//! Ties together:
//! - the speaker's inbound audio stream
//! - a [`SpeechRecognizer`] run fed with that audio
//! - the [`SegmentAccumulator`] deciding where segments end
//! - a dispatcher task translating each segment and queueing it on the
//!   pacers of its target languages
//!
//! ## Architecture
//!
//! ```text
//! speaker ─▸ IngestFrame ─▸ run_session ─▸ recognizer input
//!                               │   ◂── recognized fragments (mpsc)
//!                               │
//!                               ├─ cut ─▸ Segment ─▸ dispatcher ─▸ TranslationGateway
//!                               │                         │
//!                               │                         └─▸ PacerRegistry::enqueue
//!                               └─ EOF ─▸ stop recognizer, close session
//! ```
//!
//! The loop waits on the inbound stream with a short timeout so silence
//! keeps accumulating while the speaker sends nothing.

use futures_util::future::join_all;
use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;

use super::events::ResolvedHandshake;
use super::pacer::PacerRegistry;
use super::pipeline::{
    now_epoch_ms, Recognition, RecognitionRequest, Segment, SpeechRecognizer, SynthesisJob,
};
use super::sessions::{HistoryKind, SessionDirectory, SessionStatus};
use super::simul::{frame_duration_ms, SegmentAccumulator, SegmentationConfig};
use super::translator::{RetryPolicy, TranslationGateway};

// ── Inputs ────────────────────────────────────────────────────────

/// One item of the speaker's inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestFrame {
    /// PCM16LE mono at the configured ingest rate.
    Audio(Vec<u8>),
    Eof,
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub sample_rate: u32,
    pub bytes_per_sample: u16,
    pub segmentation: SegmentationConfig,
    pub recv_tick: Duration,
    pub retry: RetryPolicy,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            bytes_per_sample: 2,
            segmentation: SegmentationConfig::default(),
            recv_tick: Duration::from_millis(200),
            retry: RetryPolicy::default(),
        }
    }
}

/// Process-wide collaborators of every ingest loop.
pub struct IngestContext {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub translator: TranslationGateway,
    pub pacers: Arc<PacerRegistry>,
    pub sessions: Arc<SessionDirectory>,
    pub settings: IngestSettings,
}

// ── Segment ids ───────────────────────────────────────────────────

/// `{session_id}-{epoch_ms}`, bumped so ids never repeat in a session.
#[derive(Debug)]
pub struct SegmentIds {
    session_id: String,
    last_ms: i64,
}

impl SegmentIds {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            last_ms: i64::MIN,
        }
    }

    pub fn next(&mut self) -> String {
        self.next_at(now_epoch_ms())
    }

    fn next_at(&mut self, epoch_ms: i64) -> String {
        let ms = if epoch_ms <= self.last_ms {
            self.last_ms + 1
        } else {
            epoch_ms
        };
        self.last_ms = ms;
        format!("{}-{ms}", self.session_id)
    }
}

// ── Ingest loop ───────────────────────────────────────────────────

/// Run one speaker session until EOF, disconnect or recognizer failure.
///
/// Segments already cut keep flowing to the pacers after this returns;
/// text still in the buffer at the end is dropped.
pub async fn run_session<S>(
    ctx: Arc<IngestContext>,
    session: ResolvedHandshake,
    mut inbound: S,
) -> anyhow::Result<()>
where
    S: Stream<Item = IngestFrame> + Unpin + Send,
{
    let session_id = session.session_id.clone();
    let settings = &ctx.settings;
    ctx.sessions
        .open(&session_id, &session.lang_src, &session.targets)?;

    let request = RecognitionRequest {
        session_id: session_id.clone(),
        language: session.lang_src.clone(),
        sample_rate: settings.sample_rate,
        phrases: ctx.translator.glossary().terms().to_vec(),
    };
    let Recognition {
        mut input,
        mut recognized,
    } = match ctx.recognizer.start(request).await {
        Ok(recognition) => recognition,
        Err(e) => {
            ctx.sessions.close(&session_id, SessionStatus::Failed);
            return Err(e.context(format!(
                "Failed to start {} recognizer for session {session_id}",
                ctx.recognizer.name()
            )));
        }
    };

    tracing::info!(
        session_id = %session_id,
        lang_src = %session.lang_src,
        targets = ?session.targets,
        recognizer = ctx.recognizer.name(),
        "Ingest session started"
    );

    let (segment_tx, segment_rx) = mpsc::unbounded_channel::<Segment>();
    let dispatcher = tokio::spawn(dispatch_segments(Arc::clone(&ctx), segment_rx));

    let mut accumulator = SegmentAccumulator::new(settings.segmentation.clone(), Instant::now());
    let mut ids = SegmentIds::new(&session_id);
    let mut status = SessionStatus::Closed;

    'ingest: loop {
        match tokio::time::timeout(settings.recv_tick, inbound.next()).await {
            Ok(Some(IngestFrame::Audio(pcm))) => {
                ctx.sessions.record_audio(&session_id, pcm.len());
                if let Err(e) = input.write(&pcm).await {
                    tracing::error!(session_id = %session_id, error = %e, "Recognizer input failed");
                    status = SessionStatus::Failed;
                    break 'ingest;
                }
                accumulator.on_audio(frame_duration_ms(
                    pcm.len(),
                    settings.bytes_per_sample,
                    settings.sample_rate,
                ));
            }
            Ok(Some(IngestFrame::Eof)) | Ok(None) => {
                tracing::info!(session_id = %session_id, "Ingest stream ended");
                break 'ingest;
            }
            Err(_) => {}
        }

        let now = Instant::now();
        loop {
            match recognized.try_recv() {
                Ok(text) => {
                    tracing::info!(session_id = %session_id, text = %text, "STT recognized");
                    ctx.sessions
                        .record_event(&session_id, HistoryKind::Recognized, None, None, &text);
                    accumulator.on_recognized(&text, now);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    tracing::warn!(session_id = %session_id, "Recognizer stream closed");
                    status = SessionStatus::Failed;
                    break 'ingest;
                }
            }
        }

        if let Some((text, reason)) = accumulator.poll_cut(now) {
            let segment = Segment {
                session_id: session_id.clone(),
                segment_id: ids.next(),
                text,
                targets: session.targets.clone(),
            };
            tracing::info!(
                session_id = %session_id,
                segment_id = %segment.segment_id,
                reason = reason.as_str(),
                chars = segment.text.chars().count(),
                "Segment cut"
            );
            ctx.sessions.record_event(
                &session_id,
                HistoryKind::Segment,
                Some(&segment.segment_id),
                None,
                &segment.text,
            );
            // The dispatcher only exits once this sender is dropped.
            let _ = segment_tx.send(segment);
        }
    }

    input.stop().await;

    if !accumulator.is_empty() {
        let discarded = accumulator.buffer().to_string();
        tracing::warn!(
            session_id = %session_id,
            discarded_chars = discarded.chars().count(),
            "Session ended with unflushed text; discarded"
        );
        ctx.sessions
            .record_event(&session_id, HistoryKind::Discarded, None, None, &discarded);
    }

    drop(segment_tx);
    if let Err(e) = dispatcher.await {
        tracing::error!(session_id = %session_id, error = %e, "Segment dispatcher aborted");
    }

    ctx.sessions.close(&session_id, status);
    tracing::info!(session_id = %session_id, status = ?status, "Ingest session closed");
    Ok(())
}

// ── Dispatcher ────────────────────────────────────────────────────

/// Translate segments in cut order and queue each translation on its pacer.
async fn dispatch_segments(ctx: Arc<IngestContext>, mut segments: mpsc::UnboundedReceiver<Segment>) {
    let policy = ctx.settings.retry;
    while let Some(segment) = segments.recv().await {
        let translations = join_all(segment.targets.iter().map(|target| {
            let gateway = &ctx.translator;
            let text = &segment.text;
            async move { (target, gateway.translate_one(text, target, policy).await) }
        }))
        .await;

        for (target, result) in translations {
            match result {
                Ok(translated) => {
                    tracing::info!(
                        session_id = %segment.session_id,
                        segment_id = %segment.segment_id,
                        target_lang = %target,
                        text = %translated,
                        "Translation done"
                    );
                    ctx.sessions.record_event(
                        &segment.session_id,
                        HistoryKind::Translation,
                        Some(&segment.segment_id),
                        Some(target),
                        &translated,
                    );
                    ctx.pacers
                        .enqueue(SynthesisJob::new(&segment, target, translated));
                }
                Err(e) => {
                    tracing::error!(
                        session_id = %segment.session_id,
                        segment_id = %segment.segment_id,
                        target_lang = %target,
                        error = %e,
                        "Translation failed; segment dropped"
                    );
                    ctx.sessions.record_event(
                        &segment.session_id,
                        HistoryKind::TranslationFailed,
                        Some(&segment.segment_id),
                        Some(target),
                        &e.to_string(),
                    );
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────
