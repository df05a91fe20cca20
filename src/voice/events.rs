//! WebSocket message schema for the ingest and output channels.
//!
//! ## Protocol
//!
//! ```text
//! Speaker ──/ingest──▸ relay ──/out/{session}/{target}──▸ Listener
//!   handshake (text)            handshake (text)
//!   PCM16LE frames (binary)     per segment: metadata (text) + audio (binary)
//!   "EOF" (text)
//! ```

use serde::{Deserialize, Serialize};

/// Text frame that ends an ingest stream.
pub const EOF_SENTINEL: &str = "EOF";

// ── Speaker → relay ──────────────────────────────────────────────

/// First text frame on the ingest channel. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestHandshake {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang_src: Option<String>,
    /// Single target language.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Several target languages; takes precedence over `target`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
}

/// Handshake with every default filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHandshake {
    pub session_id: String,
    pub lang_src: String,
    pub targets: Vec<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl IngestHandshake {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Fill missing fields: a fresh UUID v4 id, the default source
    /// language, the default target. Duplicate targets are dropped.
    pub fn resolve(self, default_source: &str, default_target: &str) -> ResolvedHandshake {
        let mut targets: Vec<String> = Vec::new();
        let requested = if self.targets.is_empty() {
            self.target.into_iter().collect()
        } else {
            self.targets
        };
        for t in requested {
            let t = t.trim().to_string();
            if !t.is_empty() && !targets.contains(&t) {
                targets.push(t);
            }
        }
        if targets.is_empty() {
            targets.push(default_target.to_string());
        }

        ResolvedHandshake {
            session_id: non_empty(self.session_id)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            lang_src: non_empty(self.lang_src).unwrap_or_else(|| default_source.to_string()),
            targets,
        }
    }
}

// ── Relay → listener ─────────────────────────────────────────────

/// Sent once when a listener connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputHandshake {
    pub session_id: String,
    pub target: String,
    pub sample_rate: u32,
}

/// Describes the audio frame that immediately follows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipMetadata {
    pub session_id: String,
    pub segment_id: String,
    pub target: String,
    /// Translated text of the clip.
    pub text: String,
    /// Epoch seconds when synthesis of the clip began.
    pub timestamp: f64,
    pub duration_sec: f64,
}

// ── Tests ──────────────────────────────────────────────────────────
