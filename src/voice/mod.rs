//! Live interpretation pipeline.
//!
//! A speaker streams audio in; recognized text is cut into segments,
//! translated per target language, synthesized, paced and fanned out to
//! every listener of that (session, target).
//!
//! ## Design
//! - Trait-driven collaborators (`SpeechRecognizer`, `Translator`,
//!   `SpeechSynthesizer`, `OutputConnection`) with Azure and OpenAI Realtime
//!   adapters
//! - Segmentation policy on punctuation, length and silence (`simul`)
//! - Glossary terms shielded from translation by placeholders
//! - One pacer per target language (or per session and target) holding
//!   each clip until the previous one is about to finish playing

pub mod events;
pub mod glossary;
pub mod openai_realtime;
pub mod pacer;
pub mod pipeline;
pub mod sessions;
pub mod simul;
pub mod simul_session;
pub mod subscribers;
pub mod translator;
pub mod tts;

#[cfg(test)]
pub(crate) mod test_support;

pub use events::{ClipMetadata, IngestHandshake, OutputHandshake, ResolvedHandshake};
pub use glossary::Glossary;
pub use pacer::{PacerContext, PacerRegistry, PacerScope, PacerSettings, TargetPacer};
pub use pipeline::{
    PlaybackSink, Segment, SpeechRecognizer, SpeechSynthesizer, SynthesisJob, Translator,
};
pub use sessions::{SessionDirectory, SessionStatus};
pub use simul::{should_cut, SegmentAccumulator, SegmentationConfig};
pub use simul_session::{run_session, IngestContext, IngestFrame, IngestSettings};
pub use subscribers::{OutputConnection, SubscriberRegistry};
pub use translator::TranslationGateway;
