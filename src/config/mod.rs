//! Relay configuration.
//!
//! Loaded from a TOML file (every section optional), then overlaid with
//! environment variables for secrets and the common deployment knobs,
//! then validated once at startup.

use crate::voice::pacer::{PacerScope, PacerSettings};
use crate::voice::simul::{SegmentationConfig, SegmentationProfile, DEFAULT_MAX_SILENCE_MS};
use crate::voice::tts::SUPPORTED_SAMPLE_RATES;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Sections ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Longest a single listener send may take before the listener is dropped.
    pub send_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            send_timeout_secs: 5,
        }
    }
}

/// Container for synthesized audio sent to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Wav,
    Pcm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Ingest PCM sample rate.
    pub sample_rate: u32,
    pub bytes_per_sample: u16,
    /// Synthesis sample rate.
    pub output_sample_rate: u32,
    pub output_format: OutputFormat,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            bytes_per_sample: 2,
            output_sample_rate: 16_000,
            output_format: OutputFormat::Wav,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationSettings {
    pub profile: SegmentationProfile,
    /// Overrides the profile's soft limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soft_limit_chars: Option<usize>,
    /// Overrides the profile's hard limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hard_limit_chars: Option<usize>,
    pub max_silence_ms: u64,
    pub idle_timeout_ms: u64,
    pub silence_cap_ms: u64,
    /// Inbound receive timeout of the ingest loop.
    pub recv_tick_ms: u64,
}

impl Default for SegmentationSettings {
    fn default() -> Self {
        let base = SegmentationConfig::default();
        Self {
            profile: SegmentationProfile::default(),
            soft_limit_chars: None,
            hard_limit_chars: None,
            max_silence_ms: DEFAULT_MAX_SILENCE_MS,
            idle_timeout_ms: base.idle_timeout_ms,
            silence_cap_ms: base.silence_cap_ms,
            recv_tick_ms: 200,
        }
    }
}

impl SegmentationSettings {
    /// Profile limits with explicit overrides applied.
    pub fn resolve(&self) -> SegmentationConfig {
        let mut config = SegmentationConfig::for_profile(self.profile);
        if let Some(soft) = self.soft_limit_chars {
            config.soft_limit_chars = soft;
        }
        if let Some(hard) = self.hard_limit_chars {
            config.hard_limit_chars = hard;
        }
        config.max_silence_ms = self.max_silence_ms;
        config.idle_timeout_ms = self.idle_timeout_ms;
        config.silence_cap_ms = self.silence_cap_ms;
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacerConfig {
    pub lead_time_secs: f64,
    pub scope: PacerScope,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            lead_time_secs: crate::voice::pacer::LEAD_TIME_SECONDS,
            scope: PacerScope::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoicesConfig {
    /// Target whose voice is used when a target has no entry.
    pub default_target: String,
    /// target language -> neural voice name
    pub map: BTreeMap<String, String>,
}

impl Default for VoicesConfig {
    fn default() -> Self {
        Self {
            default_target: "hi-IN".into(),
            map: BTreeMap::from([("hi-IN".to_string(), "hi-IN-KavyaNeural".to_string())]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorConfig {
    pub endpoint: String,
    pub key: String,
    pub region: String,
    pub timeout_secs: u64,
    /// Extra attempts per segment and target after a failure.
    pub max_retries: u32,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.cognitive.microsofttranslator.com".into(),
            key: String::new(),
            region: String::new(),
            timeout_secs: 10,
            max_retries: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub key: String,
    pub region: String,
    /// SSML prosody rate.
    pub rate: String,
    /// Consume synthesized audio as a chunk stream.
    pub streaming: bool,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            region: String::new(),
            rate: "medium".into(),
            streaming: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    pub api_key: String,
    pub model: String,
    pub url: String,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-4o-transcribe".into(),
            url: "wss://api.openai.com/v1/realtime?intent=transcription".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlossaryConfig {
    pub path: PathBuf,
}

impl Default for GlossaryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("glossary/do_not_translate.tsv"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Source language when the speaker handshake names none.
    pub default_source: String,
    pub history_limit: usize,
    pub retention_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            default_source: "en-US".into(),
            history_limit: 200,
            retention_secs: 3600,
        }
    }
}

// ── Root ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub audio: AudioConfig,
    pub segmentation: SegmentationSettings,
    pub pacer: PacerConfig,
    pub voices: VoicesConfig,
    pub translator: TranslatorConfig,
    pub speech: SpeechConfig,
    pub recognizer: RecognizerConfig,
    pub glossary: GlossaryConfig,
    pub sessions: SessionsConfig,
}

/// `config.toml` in the platform config directory.
pub fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("dev", "interp-relay", "interp-relay")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

impl Config {
    /// Read the file (defaults when it does not exist), apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map_or_else(default_config_path, Path::to_path_buf);
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?
        } else {
            tracing::debug!(path = %path.display(), "Config file not found; using defaults");
            Self::default()
        };
        config.apply_env_overrides_from(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Overlay values found through `lookup` (normally the process env).
    pub fn apply_env_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("AZURE_SPEECH_KEY") {
            self.speech.key = v;
        }
        if let Some(v) = get("AZURE_SPEECH_REGION") {
            self.speech.region = v;
        }
        if let Some(v) = get("AZURE_TRANSLATOR_KEY") {
            self.translator.key = v;
        }
        if let Some(v) = get("AZURE_TRANSLATOR_ENDPOINT") {
            self.translator.endpoint = v;
        }
        if let Some(v) = get("AZURE_TRANSLATOR_REGION") {
            self.translator.region = v;
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.recognizer.api_key = v;
        }
        if let Some(v) = get("SOURCE_LANG") {
            self.sessions.default_source = v;
        }
        if let Some(v) = get("TARGET_LANG") {
            self.voices.default_target = v;
        }
        if let Some(v) = get("TTS_VOICE") {
            self.voices
                .map
                .insert(self.voices.default_target.clone(), v);
        }
        if let Some(v) = get("SAMPLE_RATE") {
            self.audio.sample_rate = v
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("SAMPLE_RATE is not a number: {v}")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.audio.sample_rate == 0 {
            return invalid("audio.sample_rate must be positive".into());
        }
        if self.audio.bytes_per_sample != 2 {
            return invalid(format!(
                "audio.bytes_per_sample must be 2 (PCM16), got {}",
                self.audio.bytes_per_sample
            ));
        }
        if !SUPPORTED_SAMPLE_RATES.contains(&self.audio.output_sample_rate) {
            return invalid(format!(
                "audio.output_sample_rate {} is not one of {:?}",
                self.audio.output_sample_rate, SUPPORTED_SAMPLE_RATES
            ));
        }

        let seg = self.segmentation.resolve();
        if seg.soft_limit_chars > seg.hard_limit_chars {
            return invalid(format!(
                "segmentation soft limit {} exceeds hard limit {}",
                seg.soft_limit_chars, seg.hard_limit_chars
            ));
        }
        if self.gateway.send_timeout_secs == 0 {
            return invalid("gateway.send_timeout_secs must be positive".into());
        }
        if self.segmentation.recv_tick_ms == 0 {
            return invalid("segmentation.recv_tick_ms must be positive".into());
        }

        let lead = self.pacer.lead_time_secs;
        if !lead.is_finite() || lead < 0.0 {
            return invalid(format!(
                "pacer.lead_time_secs must be a non-negative number, got {lead}"
            ));
        }

        self.voice_table()?;
        Ok(())
    }

    pub fn voice_table(&self) -> Result<VoiceTable, ConfigError> {
        VoiceTable::new(&self.voices.default_target, self.voices.map.clone())
    }

    pub fn pacer_settings(&self) -> PacerSettings {
        PacerSettings {
            lead_time: Duration::from_secs_f64(self.pacer.lead_time_secs.max(0.0)),
            output_sample_rate: self.audio.output_sample_rate,
            bytes_per_sample: self.audio.bytes_per_sample,
            output_format: self.audio.output_format,
            rate: self.speech.rate.clone(),
        }
    }

    /// Copy with every secret masked, for display.
    pub fn redacted(&self) -> Self {
        fn mask(value: &mut String) {
            if !value.is_empty() {
                *value = "***".into();
            }
        }
        let mut copy = self.clone();
        mask(&mut copy.speech.key);
        mask(&mut copy.translator.key);
        mask(&mut copy.recognizer.api_key);
        copy
    }
}

// ── Voice table ────────────────────────────────────────────────────

/// Target language to synthesis voice, with a guaranteed fallback.
#[derive(Debug, Clone)]
pub struct VoiceTable {
    default_target: String,
    default_voice: String,
    map: BTreeMap<String, String>,
}

impl VoiceTable {
    pub fn new(default_target: &str, map: BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let default_voice = map
            .get(default_target)
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "voices.map has no voice for the default target {default_target}"
                ))
            })?;
        Ok(Self {
            default_target: default_target.to_string(),
            default_voice,
            map,
        })
    }

    /// Voice for `target`, falling back to the default target's voice.
    pub fn resolve(&self, target: &str) -> &str {
        self.map
            .get(target)
            .map(String::as_str)
            .unwrap_or(&self.default_voice)
    }

    pub fn default_target(&self) -> &str {
        &self.default_target
    }
}
