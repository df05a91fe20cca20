//! Synthesis pacing.
//!
//! A [`TargetPacer`] owns a FIFO of translated segments and a single worker
//! task that synthesizes them one at a time. Before each synthesis it waits
//! until the previous clip is within `lead` of finishing playback, so
//! listeners get back-to-back clips without overlap and without long gaps:
//!
//! ```text
//! lead = min(last_clip_duration, lead_time)
//! wait = max(0, expected_playback_end - lead - now)
//! ```

use super::events::ClipMetadata;
use super::pipeline::{
    now_epoch_secs, PlaybackSink, SpeechSynthesizer, SynthesisJob, SynthesisOutput,
    SynthesisRequest,
};
use super::subscribers::SubscriberRegistry;
use super::tts::{clip_duration_secs, wrap_wav};
use crate::config::{OutputFormat, VoiceTable};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

/// Default lead time in seconds.
pub const LEAD_TIME_SECONDS: f64 = 1.5;

#[derive(Debug, Clone)]
pub struct PacerSettings {
    pub lead_time: Duration,
    pub output_sample_rate: u32,
    pub bytes_per_sample: u16,
    pub output_format: OutputFormat,
    /// SSML prosody rate.
    pub rate: String,
}

impl Default for PacerSettings {
    fn default() -> Self {
        Self {
            lead_time: Duration::from_secs_f64(LEAD_TIME_SECONDS),
            output_sample_rate: 16_000,
            bytes_per_sample: 2,
            output_format: OutputFormat::Wav,
            rate: "medium".into(),
        }
    }
}

/// Collaborators shared by every pacer.
pub struct PacerContext {
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub subscribers: Arc<SubscriberRegistry>,
    pub voices: Arc<VoiceTable>,
    pub playback: Option<Arc<dyn PlaybackSink>>,
    pub settings: PacerSettings,
}

#[derive(Debug, Default)]
struct Timing {
    expected_playback_end: Option<Instant>,
    last_clip_duration: Duration,
}

#[derive(Default)]
struct JobQueue {
    jobs: VecDeque<SynthesisJob>,
    worker_running: bool,
}

// ── Pacer ──────────────────────────────────────────────────────────

pub struct TargetPacer {
    key: String,
    ctx: Arc<PacerContext>,
    /// Held for the whole of one job.
    timing: AsyncMutex<Timing>,
    queue: Mutex<JobQueue>,
}

impl TargetPacer {
    pub fn new(key: impl Into<String>, ctx: Arc<PacerContext>) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            ctx,
            timing: AsyncMutex::new(Timing::default()),
            queue: Mutex::new(JobQueue::default()),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Queue a job, starting the worker if none is running.
    pub fn enqueue(self: &Arc<Self>, job: SynthesisJob) {
        let start_worker = {
            let mut queue = self.queue.lock();
            queue.jobs.push_back(job);
            !std::mem::replace(&mut queue.worker_running, true)
        };
        if start_worker {
            let pacer = Arc::clone(self);
            tokio::spawn(async move { pacer.run_worker().await });
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().jobs.len()
    }

    /// No worker is running and nothing is queued.
    pub fn is_idle(&self) -> bool {
        let queue = self.queue.lock();
        !queue.worker_running && queue.jobs.is_empty()
    }

    async fn run_worker(self: Arc<Self>) {
        tracing::debug!(pacer = %self.key, "Pacer worker started");
        loop {
            let job = {
                let mut queue = self.queue.lock();
                match queue.jobs.pop_front() {
                    Some(job) => job,
                    None => {
                        queue.worker_running = false;
                        break;
                    }
                }
            };
            self.process(job).await;
        }
        tracing::debug!(pacer = %self.key, "Pacer worker drained");
    }

    fn pacing_wait(&self, timing: &Timing, now: Instant) -> Duration {
        let Some(end) = timing.expected_playback_end else {
            return Duration::ZERO;
        };
        let lead = timing.last_clip_duration.min(self.ctx.settings.lead_time);
        end.checked_sub(lead)
            .map(|start_at| start_at.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    async fn process(&self, job: SynthesisJob) {
        let mut timing = self.timing.lock().await;

        if job.text.trim().is_empty() {
            tracing::debug!(
                session_id = %job.session_id,
                segment_id = %job.segment_id,
                target_lang = %job.target,
                "Empty translation; nothing to synthesize"
            );
            return;
        }

        let settings = &self.ctx.settings;
        let wait = self.pacing_wait(&timing, Instant::now());
        if !wait.is_zero() {
            tracing::info!(
                session_id = %job.session_id,
                segment_id = %job.segment_id,
                target_lang = %job.target,
                wait_secs = wait.as_secs_f64(),
                "TTS wait"
            );
            tokio::time::sleep(wait).await;
        }

        let voice = self.ctx.voices.resolve(&job.target).to_string();
        let request = SynthesisRequest {
            text: job.text.clone(),
            voice: voice.clone(),
            rate: settings.rate.clone(),
            sample_rate: settings.output_sample_rate,
        };

        let send_ts = Instant::now();
        let timestamp = now_epoch_secs();
        tracing::info!(
            session_id = %job.session_id,
            segment_id = %job.segment_id,
            target_lang = %job.target,
            voice = %voice,
            queued_secs = send_ts.saturating_duration_since(job.enqueued_at).as_secs_f64(),
            "TTS start"
        );

        let pcm = match self.collect_audio(&request).await {
            Ok(pcm) => pcm,
            Err(e) => {
                tracing::error!(
                    session_id = %job.session_id,
                    segment_id = %job.segment_id,
                    target_lang = %job.target,
                    error = %e,
                    "TTS failed; skipping segment"
                );
                return;
            }
        };

        let duration =
            clip_duration_secs(pcm.len(), settings.output_sample_rate, settings.bytes_per_sample);
        let clip = Duration::from_secs_f64(duration);
        timing.expected_playback_end = Some(send_ts + clip);
        timing.last_clip_duration = clip;

        let metadata = ClipMetadata {
            session_id: job.session_id.clone(),
            segment_id: job.segment_id.clone(),
            target: job.target.clone(),
            text: job.text.clone(),
            timestamp,
            duration_sec: duration,
        };
        let bytes = pcm.len();
        let audio = match settings.output_format {
            OutputFormat::Pcm => pcm,
            OutputFormat::Wav => match wrap_wav(&pcm, settings.output_sample_rate) {
                Ok(wav) => wav,
                Err(e) => {
                    tracing::error!(
                        session_id = %job.session_id,
                        segment_id = %job.segment_id,
                        error = %e,
                        "Failed to wrap clip as WAV; sending raw PCM"
                    );
                    pcm
                }
            },
        };

        let delivered = self
            .ctx
            .subscribers
            .broadcast(&job.session_id, &job.target, &metadata, &audio)
            .await;
        tracing::info!(
            session_id = %job.session_id,
            segment_id = %job.segment_id,
            target_lang = %job.target,
            bytes,
            duration_secs = duration,
            listeners = delivered,
            "TTS done"
        );
    }

    /// Synthesize into one buffer, tapping live playback per frame.
    async fn collect_audio(&self, request: &SynthesisRequest) -> anyhow::Result<Vec<u8>> {
        let playback = self.ctx.playback.as_deref();
        match self.ctx.synthesizer.synthesize(request).await? {
            SynthesisOutput::Complete(pcm) => {
                if let Some(sink) = playback {
                    sink.play(&pcm);
                }
                Ok(pcm)
            }
            SynthesisOutput::Frames(mut frames) => {
                let mut pcm = Vec::new();
                while let Some(frame) = frames.next().await {
                    let frame = frame?;
                    if let Some(sink) = playback {
                        sink.play(&frame);
                    }
                    pcm.extend_from_slice(&frame);
                }
                Ok(pcm)
            }
        }
    }
}

// ── Registry ───────────────────────────────────────────────────────

/// Which jobs share a pacer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacerScope {
    /// One pacer per target language across all sessions.
    #[default]
    Target,
    /// One pacer per (session, target language).
    SessionTarget,
}

/// Lazily created pacers, kept for the life of the process.
pub struct PacerRegistry {
    scope: PacerScope,
    ctx: Arc<PacerContext>,
    pacers: Mutex<HashMap<String, Arc<TargetPacer>>>,
}

impl PacerRegistry {
    pub fn new(scope: PacerScope, ctx: Arc<PacerContext>) -> Self {
        Self {
            scope,
            ctx,
            pacers: Mutex::new(HashMap::new()),
        }
    }

    pub fn key_for(&self, session_id: &str, target: &str) -> String {
        match self.scope {
            PacerScope::Target => target.to_string(),
            PacerScope::SessionTarget => format!("{session_id}/{target}"),
        }
    }

    pub fn pacer_for(&self, session_id: &str, target: &str) -> Arc<TargetPacer> {
        let key = self.key_for(session_id, target);
        let mut pacers = self.pacers.lock();
        Arc::clone(
            pacers
                .entry(key.clone())
                .or_insert_with(|| TargetPacer::new(key, Arc::clone(&self.ctx))),
        )
    }

    pub fn enqueue(&self, job: SynthesisJob) {
        self.pacer_for(&job.session_id, &job.target).enqueue(job);
    }

    pub fn len(&self) -> usize {
        self.pacers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pacers.lock().is_empty()
    }

    pub fn scope(&self) -> PacerScope {
        self.scope
    }

    /// Every pacer has an empty queue and no running worker.
    pub fn is_idle(&self) -> bool {
        self.pacers.lock().values().all(|p| p.is_idle())
    }
}
