//! Live speech interpretation relay.
//!
//! Speakers stream PCM audio over `/ingest`; listeners receive translated,
//! synthesized clips per target language over `/out/{session}/{target}`.

pub mod config;
pub mod gateway;
pub mod voice;
