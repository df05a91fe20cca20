//! Speech synthesis adapter and output audio framing.

use super::pipeline::{SpeechSynthesizer, SynthesisError, SynthesisOutput, SynthesisRequest};
use async_trait::async_trait;
use futures_util::StreamExt;
use quick_xml::escape::escape;
use std::io::Cursor;
use std::time::Duration;

/// PCM sample rates the synthesis service can produce.
pub const SUPPORTED_SAMPLE_RATES: [u32; 4] = [8_000, 16_000, 24_000, 48_000];

/// Raw 16-bit mono PCM output format name for `rate`.
pub fn azure_output_format(rate: u32) -> Result<&'static str, SynthesisError> {
    match rate {
        8_000 => Ok("raw-8khz-16bit-mono-pcm"),
        16_000 => Ok("raw-16khz-16bit-mono-pcm"),
        24_000 => Ok("raw-24khz-16bit-mono-pcm"),
        48_000 => Ok("raw-48khz-16bit-mono-pcm"),
        other => Err(SynthesisError::UnsupportedSampleRate(other)),
    }
}

/// Locale prefix of a voice name (`hi-IN-KavyaNeural` → `hi-IN`).
pub fn voice_locale(voice: &str) -> String {
    let mut parts = voice.splitn(3, '-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(lang), Some(region), Some(_)) => format!("{lang}-{region}"),
        _ => "en-US".to_string(),
    }
}

pub fn build_ssml(text: &str, voice: &str, rate: &str) -> String {
    let locale = voice_locale(voice);
    format!(
        "<speak version='1.0' xmlns='http://www.w3.org/2001/10/synthesis' xml:lang='{locale}'>\
<voice name='{voice}'><prosody rate='{rate}'>{}</prosody></voice></speak>",
        escape(text),
        voice = escape(voice),
        rate = escape(rate),
    )
}

// ── Azure Speech REST ────────────────────────────────────────────

/// Azure neural TTS over the REST endpoint.
pub struct AzureSynthesizer {
    url: String,
    key: String,
    /// Yield body chunks as they arrive instead of one buffer.
    streaming: bool,
    client: reqwest::Client,
}

impl AzureSynthesizer {
    pub fn new(region: &str, key: &str, streaming: bool) -> Self {
        Self::with_url(
            &format!("https://{region}.tts.speech.microsoft.com/cognitiveservices/v1"),
            key,
            streaming,
        )
    }

    pub fn with_url(url: &str, key: &str, streaming: bool) -> Self {
        Self {
            url: url.to_string(),
            key: key.to_string(),
            streaming,
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for AzureSynthesizer {
    async fn synthesize(
        &self,
        request: &SynthesisRequest,
    ) -> Result<SynthesisOutput, SynthesisError> {
        let format = azure_output_format(request.sample_rate)?;
        let ssml = build_ssml(&request.text, &request.voice, &request.rate);

        let resp = self
            .client
            .post(&self.url)
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .header("Content-Type", "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", format)
            .header("User-Agent", "interp-relay")
            .body(ssml)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SynthesisError::Status {
                status: status.as_u16(),
                body,
            });
        }

        // The service reports a canceled synthesis as a success with no
        // audio, or by cutting the body short.
        if self.streaming {
            let frames = resp
                .bytes_stream()
                .map(|chunk| {
                    chunk.map(|b| b.to_vec()).map_err(|e| {
                        SynthesisError::Canceled(format!("audio stream interrupted: {e}"))
                    })
                })
                .boxed();
            Ok(SynthesisOutput::Frames(frames))
        } else {
            let body = resp
                .bytes()
                .await
                .map_err(|e| SynthesisError::Canceled(format!("audio body interrupted: {e}")))?;
            if body.is_empty() {
                return Err(SynthesisError::Canceled("service returned no audio".into()));
            }
            Ok(SynthesisOutput::Complete(body.to_vec()))
        }
    }
}

// ── Output framing ───────────────────────────────────────────────

/// Clip length in seconds for `bytes` of PCM.
pub fn clip_duration_secs(bytes: usize, sample_rate: u32, bytes_per_sample: u16) -> f64 {
    let denom = f64::from(sample_rate) * f64::from(bytes_per_sample);
    if denom <= 0.0 {
        return 0.0;
    }
    bytes as f64 / denom
}

/// Wrap PCM16LE mono samples in a RIFF/WAVE container.
pub fn wrap_wav(pcm: &[u8], sample_rate: u32) -> anyhow::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for chunk in pcm.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([chunk[0], chunk[1]]))?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}
