//! Segmentation policy for simultaneous interpretation.
//!
//! Recognized fragments are accumulated into a buffer until one of the cut
//! conditions fires, at which point the whole buffer becomes one
//! translatable segment:
//!
//! 1. **Punctuation**: the buffer ends with a sentence-terminal mark
//!    (Latin `. ? !`, Devanagari `। ॥`, ellipsis `…`).
//! 2. **Silence**: the silence counter reached [`SILENCE_CUT_MS`] (or the
//!    absolute `max_silence_ms`).
//! 3. **Idle**: no recognized text arrived for `idle_timeout_ms`.
//! 4. **Soft limit**: buffer is at least `soft_limit_chars` long and ends
//!    with terminal punctuation.
//! 5. **Hard limit**: buffer is at least `hard_limit_chars` long, even in
//!    the middle of a sentence.
//!
//! The silence counter grows with wall-clock time between loop iterations
//! (capped at `silence_cap_ms`) and shrinks with the playback duration of
//! every audio frame received, so ongoing speech keeps it near zero.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Sentence-terminal marks that end a segment.
pub const TERMINAL_MARKS: &[char] = &['.', '?', '!', '।', '॥', '…'];

/// Silence after which a non-terminated buffer is cut.
pub const SILENCE_CUT_MS: u64 = 800;

/// Default absolute silence ceiling used by [`should_cut`].
pub const DEFAULT_MAX_SILENCE_MS: u64 = 3000;

// ── Policy ─────────────────────────────────────────────────────────

/// Whether `text` ends with a sentence-terminal mark.
pub fn ends_with_terminal(text: &str) -> bool {
    text.trim_end().ends_with(TERMINAL_MARKS)
}

/// Pure cut decision over the accumulated text and elapsed silence.
pub fn should_cut(text: &str, silence_ms: u64, max_ms: u64) -> bool {
    ends_with_terminal(text) || silence_ms >= SILENCE_CUT_MS || silence_ms >= max_ms
}

/// Playback duration of a PCM frame in whole milliseconds.
pub fn frame_duration_ms(len: usize, bytes_per_sample: u16, sample_rate: u32) -> u64 {
    let bytes_per_sec = u64::from(bytes_per_sample) * u64::from(sample_rate);
    if bytes_per_sec == 0 {
        return 0;
    }
    len as u64 * 1000 / bytes_per_sec
}

// ── Configuration ──────────────────────────────────────────────────

/// Named soft/hard limit presets observed in deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationProfile {
    /// Short segments (~20/40 chars) for minimal latency.
    #[default]
    LowLatency,
    /// Long segments (~400/600 chars) for batched translation.
    Batched,
}

impl SegmentationProfile {
    /// `(soft, hard)` character limits of the profile.
    pub fn limits(self) -> (usize, usize) {
        match self {
            Self::LowLatency => (20, 40),
            Self::Batched => (400, 600),
        }
    }
}

/// Thresholds used by the ingest loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentationConfig {
    /// Cut at this length when the buffer also ends with terminal punctuation.
    pub soft_limit_chars: usize,
    /// Cut unconditionally at this length.
    pub hard_limit_chars: usize,
    /// Absolute silence ceiling passed to [`should_cut`].
    pub max_silence_ms: u64,
    /// Cut a non-empty buffer when no fragment arrived for this long.
    pub idle_timeout_ms: u64,
    /// Upper bound of the silence counter.
    pub silence_cap_ms: u64,
}

impl SegmentationConfig {
    pub fn for_profile(profile: SegmentationProfile) -> Self {
        let (soft, hard) = profile.limits();
        Self {
            soft_limit_chars: soft,
            hard_limit_chars: hard,
            ..Self::default()
        }
    }
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        let (soft, hard) = SegmentationProfile::LowLatency.limits();
        Self {
            soft_limit_chars: soft,
            hard_limit_chars: hard,
            max_silence_ms: DEFAULT_MAX_SILENCE_MS,
            idle_timeout_ms: 2000,
            silence_cap_ms: 2000,
        }
    }
}

// ── Cut reasons ────────────────────────────────────────────────────

/// Why the accumulator released its buffer. Logged with each segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CutReason {
    Punctuation,
    Silence,
    Idle,
    SoftLimit,
    HardLimit,
}

impl CutReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Punctuation => "punctuation",
            Self::Silence => "silence",
            Self::Idle => "idle",
            Self::SoftLimit => "soft_limit",
            Self::HardLimit => "hard_limit",
        }
    }
}

// ── Accumulator ────────────────────────────────────────────────────

/// Per-session text buffer and silence bookkeeping.
///
/// Owned exclusively by the session's ingest loop; all timestamps are
/// passed in so the state machine can be driven deterministically.
#[derive(Debug)]
pub struct SegmentAccumulator {
    config: SegmentationConfig,
    buffer: String,
    silence_ms: u64,
    last_tick: Instant,
    last_recognized: Option<Instant>,
}

impl SegmentAccumulator {
    pub fn new(config: SegmentationConfig, now: Instant) -> Self {
        Self {
            config,
            buffer: String::new(),
            silence_ms: 0,
            last_tick: now,
            last_recognized: None,
        }
    }

    /// An audio frame of `frame_ms` playback arrived.
    pub fn on_audio(&mut self, frame_ms: u64) {
        self.silence_ms = self.silence_ms.saturating_sub(frame_ms);
    }

    /// Append a finalized fragment, space-joined.
    pub fn on_recognized(&mut self, fragment: &str, now: Instant) {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return;
        }
        if !self.buffer.is_empty() {
            self.buffer.push(' ');
        }
        self.buffer.push_str(fragment);
        self.last_recognized = Some(now);
    }

    /// Advance the silence counter by the time since the previous tick.
    pub fn tick(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_tick).as_millis() as u64;
        self.last_tick = now;
        self.silence_ms = self
            .silence_ms
            .saturating_add(elapsed)
            .min(self.config.silence_cap_ms);
    }

    /// Evaluate the cut conditions without mutating the buffer.
    pub fn evaluate(&self, now: Instant) -> Option<CutReason> {
        if self.buffer.is_empty() {
            return None;
        }
        let chars = self.buffer.chars().count();
        if chars >= self.config.hard_limit_chars {
            return Some(CutReason::HardLimit);
        }
        if ends_with_terminal(&self.buffer) {
            return Some(if chars >= self.config.soft_limit_chars {
                CutReason::SoftLimit
            } else {
                CutReason::Punctuation
            });
        }
        if should_cut(&self.buffer, self.silence_ms, self.config.max_silence_ms) {
            return Some(CutReason::Silence);
        }
        let idle_ms = self
            .last_recognized
            .map(|at| now.saturating_duration_since(at).as_millis() as u64)
            .unwrap_or(0);
        if idle_ms >= self.config.idle_timeout_ms {
            return Some(CutReason::Idle);
        }
        None
    }

    /// Tick, evaluate, and on a cut hand back the buffer and reset
    /// the buffer and silence counter.
    pub fn poll_cut(&mut self, now: Instant) -> Option<(String, CutReason)> {
        self.tick(now);
        let reason = self.evaluate(now)?;
        self.silence_ms = 0;
        Some((std::mem::take(&mut self.buffer), reason))
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn silence_ms(&self) -> u64 {
        self.silence_ms
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn accumulator(config: SegmentationConfig) -> (SegmentAccumulator, Instant) {
        let start = Instant::now();
        (SegmentAccumulator::new(config, start), start)
    }

    #[test]
    fn no_cut_without_terminal_or_silence() {
        for text in ["Hello", "we were going to", "नमस्ते", "wait,"] {
            assert!(!should_cut(text, 0, DEFAULT_MAX_SILENCE_MS), "{text}");
            assert!(!should_cut(text, 799, DEFAULT_MAX_SILENCE_MS), "{text}");
        }
    }

    #[test]
    fn terminal_marks_always_cut() {
        for text in ["Done.", "Really?", "Stop!", "ठीक है।", "समाप्त॥", "and then…"] {
            assert!(should_cut(text, 0, DEFAULT_MAX_SILENCE_MS), "{text}");
        }
    }

    #[test]
    fn silence_cuts_unterminated_text() {
        assert!(should_cut("still talking", 800, DEFAULT_MAX_SILENCE_MS));
        assert!(should_cut("still talking", 1500, DEFAULT_MAX_SILENCE_MS));
    }

    #[test]
    fn max_silence_is_an_independent_ceiling() {
        assert!(should_cut("x", 500, 500));
        assert!(!should_cut("x", 499, 500));
    }

    #[test]
    fn frame_duration_for_pcm16_mono() {
        // 100 ms at 16 kHz PCM16 = 3200 bytes
        assert_eq!(frame_duration_ms(3200, 2, 16_000), 100);
        assert_eq!(frame_duration_ms(0, 2, 16_000), 0);
        assert_eq!(frame_duration_ms(3200, 2, 0), 0);
    }

    #[test]
    fn profiles_expose_both_limit_sets() {
        let short = SegmentationConfig::for_profile(SegmentationProfile::LowLatency);
        assert_eq!((short.soft_limit_chars, short.hard_limit_chars), (20, 40));
        let long = SegmentationConfig::for_profile(SegmentationProfile::Batched);
        assert_eq!((long.soft_limit_chars, long.hard_limit_chars), (400, 600));
        assert_eq!(long.idle_timeout_ms, 2000);
    }

    #[test]
    fn fragments_are_space_joined_in_order() {
        let (mut acc, start) = accumulator(SegmentationConfig::default());
        acc.on_recognized("Hello", start);
        acc.on_recognized("  world  ", start);
        acc.on_recognized("", start);
        assert_eq!(acc.buffer(), "Hello world");
    }

    #[test]
    fn punctuation_cuts_immediately_and_resets() {
        let (mut acc, start) = accumulator(SegmentationConfig::default());
        acc.on_recognized("Hello there.", start);
        let (text, reason) = acc.poll_cut(start).expect("cut");
        assert_eq!(text, "Hello there.");
        assert_eq!(reason, CutReason::Punctuation);
        assert!(acc.is_empty());
        assert_eq!(acc.silence_ms(), 0);
    }

    #[test]
    fn long_terminated_sentence_is_a_soft_limit_cut() {
        let (mut acc, start) = accumulator(SegmentationConfig::default());
        let sentence = "This sentence is long enough.";
        assert!((20..40).contains(&sentence.chars().count()));
        acc.on_recognized(sentence, start);
        let (text, reason) = acc.poll_cut(start).expect("cut");
        assert_eq!(text, sentence);
        assert_eq!(reason, CutReason::SoftLimit);
        assert_eq!(reason.as_str(), "soft_limit");
    }

    #[test]
    fn silence_accumulates_across_ticks_and_is_capped() {
        let (mut acc, start) = accumulator(SegmentationConfig::default());
        acc.tick(start + Duration::from_millis(300));
        assert_eq!(acc.silence_ms(), 300);
        acc.tick(start + Duration::from_millis(10_000));
        assert_eq!(acc.silence_ms(), 2000);
    }

    #[test]
    fn audio_frames_reduce_silence() {
        let (mut acc, start) = accumulator(SegmentationConfig::default());
        acc.tick(start + Duration::from_millis(600));
        acc.on_audio(200);
        assert_eq!(acc.silence_ms(), 400);
        acc.on_audio(1000);
        assert_eq!(acc.silence_ms(), 0);
    }

    #[test]
    fn silence_threshold_cuts_unterminated_buffer() {
        let (mut acc, start) = accumulator(SegmentationConfig::default());
        acc.on_recognized("we should", start);
        assert!(acc.poll_cut(start + Duration::from_millis(500)).is_none());
        let (text, reason) = acc
            .poll_cut(start + Duration::from_millis(800))
            .expect("cut");
        assert_eq!(text, "we should");
        assert_eq!(reason, CutReason::Silence);
    }

    #[test]
    fn idle_timeout_cuts_even_while_audio_flows() {
        let (mut acc, start) = accumulator(SegmentationConfig::default());
        acc.on_recognized("so the plan", start);
        for step in 1..=10 {
            let now = start + Duration::from_millis(200 * step);
            acc.on_audio(200);
            if let Some((text, reason)) = acc.poll_cut(now) {
                assert_eq!(text, "so the plan");
                assert_eq!(reason, CutReason::Idle);
                assert!(step >= 10);
                return;
            }
        }
        panic!("idle timeout never fired");
    }

    #[test]
    fn empty_buffer_never_cuts() {
        let (mut acc, start) = accumulator(SegmentationConfig::default());
        assert!(acc.poll_cut(start + Duration::from_secs(10)).is_none());
    }

    #[test]
    fn hard_limit_forces_mid_sentence_cut() {
        let config = SegmentationConfig::default();
        let (mut acc, start) = accumulator(config);
        let long = "alpha bravo charlie delta echo foxtrot golf";
        assert!(long.chars().count() >= 40);
        acc.on_recognized(long, start);
        let (text, reason) = acc.poll_cut(start).expect("cut");
        assert_eq!(text, long);
        assert_eq!(reason, CutReason::HardLimit);

        acc.on_recognized("hotel india", start);
        assert_eq!(acc.buffer(), "hotel india");
        assert!(acc.poll_cut(start).is_none());
    }

    #[test]
    fn hard_limit_counts_chars_not_bytes() {
        let (mut acc, start) = accumulator(SegmentationConfig::default());
        // 20 chars but 56 bytes; must not trip the 40-char limit
        acc.on_recognized("नमस्ते दुनिया नमस्ते", start);
        assert!(acc.buffer().len() >= 40);
        assert!(acc.poll_cut(start).is_none());
    }

    #[test]
    fn batched_profile_holds_long_unterminated_text() {
        let config = SegmentationConfig::for_profile(SegmentationProfile::Batched);
        let (mut acc, start) = accumulator(config);
        acc.on_recognized(&"word ".repeat(50), start);
        assert!(acc.poll_cut(start).is_none());
        acc.on_recognized(&"word ".repeat(80), start);
        let (_, reason) = acc.poll_cut(start).expect("cut");
        assert_eq!(reason, CutReason::HardLimit);
    }
}
