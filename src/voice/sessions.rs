//! In-memory directory of live and recently closed interpretation sessions.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Listening,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Recognized,
    Segment,
    Translation,
    TranslationFailed,
    Discarded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub kind: HistoryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub audio_bytes: u64,
    pub recognized_fragments: u64,
    pub segments_dispatched: u64,
    pub segments_translated: u64,
    pub translation_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub lang_src: String,
    pub targets: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub stats: SessionStats,
    pub history: VecDeque<HistoryEntry>,
}

/// Listing view without the history log.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub lang_src: String,
    pub targets: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub stats: SessionStats,
}

impl From<&SessionRecord> for SessionSummary {
    fn from(record: &SessionRecord) -> Self {
        Self {
            id: record.id.clone(),
            lang_src: record.lang_src.clone(),
            targets: record.targets.clone(),
            started_at: record.started_at,
            ended_at: record.ended_at,
            status: record.status,
            stats: record.stats.clone(),
        }
    }
}

pub struct SessionDirectory {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    history_limit: usize,
    retention: Duration,
}

impl SessionDirectory {
    pub fn new(history_limit: usize, retention: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            history_limit: history_limit.max(1),
            retention,
        }
    }

    pub fn shared(history_limit: usize, retention: Duration) -> Arc<Self> {
        Arc::new(Self::new(history_limit, retention))
    }

    /// Register a session. Reusing the id of a closed session replaces it;
    /// reusing a live one is an error.
    pub fn open(&self, id: &str, lang_src: &str, targets: &[String]) -> anyhow::Result<()> {
        let mut sessions = self.sessions.lock();
        if sessions
            .get(id)
            .is_some_and(|s| s.status == SessionStatus::Listening)
        {
            anyhow::bail!("Session {id} is already live");
        }
        sessions.insert(
            id.to_string(),
            SessionRecord {
                id: id.to_string(),
                lang_src: lang_src.to_string(),
                targets: targets.to_vec(),
                started_at: Utc::now(),
                ended_at: None,
                status: SessionStatus::Listening,
                stats: SessionStats::default(),
                history: VecDeque::new(),
            },
        );
        Ok(())
    }

    pub fn close(&self, id: &str, status: SessionStatus) {
        if let Some(record) = self.sessions.lock().get_mut(id) {
            record.status = status;
            record.ended_at = Some(Utc::now());
        }
    }

    fn with_record(&self, id: &str, f: impl FnOnce(&mut SessionRecord)) {
        if let Some(record) = self.sessions.lock().get_mut(id) {
            f(record);
        }
    }

    fn push_history(record: &mut SessionRecord, limit: usize, entry: HistoryEntry) {
        if record.history.len() >= limit {
            record.history.pop_front();
        }
        record.history.push_back(entry);
    }

    pub fn record_audio(&self, id: &str, bytes: usize) {
        self.with_record(id, |r| r.stats.audio_bytes += bytes as u64);
    }

    pub fn record_event(
        &self,
        id: &str,
        kind: HistoryKind,
        segment_id: Option<&str>,
        target: Option<&str>,
        text: &str,
    ) {
        let limit = self.history_limit;
        self.with_record(id, |r| {
            match kind {
                HistoryKind::Recognized => r.stats.recognized_fragments += 1,
                HistoryKind::Segment => r.stats.segments_dispatched += 1,
                HistoryKind::Translation => r.stats.segments_translated += 1,
                HistoryKind::TranslationFailed => r.stats.translation_failures += 1,
                HistoryKind::Discarded => {}
            }
            Self::push_history(
                r,
                limit,
                HistoryEntry {
                    at: Utc::now(),
                    kind,
                    segment_id: segment_id.map(str::to_string),
                    target: target.map(str::to_string),
                    text: text.to_string(),
                },
            );
        });
    }

    pub fn get(&self, id: &str) -> Option<SessionRecord> {
        self.sessions.lock().get(id).cloned()
    }

    /// Summaries, most recent first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.lock();
        let mut out: Vec<SessionSummary> = sessions.values().map(SessionSummary::from).collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out
    }

    pub fn live_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.status == SessionStatus::Listening)
            .count()
    }

    /// Drop ended sessions older than the retention window.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| match s.ended_at {
            Some(ended) => now.signed_duration_since(ended) < retention,
            None => true,
        });
        before - sessions.len()
    }
}
