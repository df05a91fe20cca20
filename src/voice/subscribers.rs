//! Listener fan-out.
//!
//! Live output connections are grouped per (session, target). Each group
//! sits behind its own async mutex, taken by subscribe, unsubscribe and
//! broadcast alike, so a connection that subscribes while a clip is going
//! out either receives the whole clip or none of it. The outer map is a
//! plain synchronous lock and is never held across an await.
//!
//! Every send is bounded by a timeout. A listener that stops reading is
//! dropped like a closed one instead of stalling the pacer behind it.

use super::events::{ClipMetadata, OutputHandshake};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// Longest a single frame may take to reach one listener.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// One listener socket, seen from the registry.
#[async_trait]
pub trait OutputConnection: Send + Sync {
    /// Process-unique id used for unsubscribe.
    fn id(&self) -> u64;

    async fn send_text(&self, text: String) -> anyhow::Result<()>;

    async fn send_binary(&self, data: Vec<u8>) -> anyhow::Result<()>;
}

#[derive(Default)]
struct Bucket {
    connections: Vec<Arc<dyn OutputConnection>>,
    /// Set once the bucket has been emptied and unlinked from the map.
    retired: bool,
}

type SharedBucket = Arc<AsyncMutex<Bucket>>;

pub struct SubscriberRegistry {
    /// session_id -> target -> bucket
    buckets: Mutex<HashMap<String, HashMap<String, SharedBucket>>>,
    /// Advertised in the listener handshake.
    sample_rate: u32,
    send_timeout: Duration,
}

impl SubscriberRegistry {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            sample_rate,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    async fn bounded(
        &self,
        send: impl Future<Output = anyhow::Result<()>>,
    ) -> anyhow::Result<()> {
        match tokio::time::timeout(self.send_timeout, send).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("send timed out after {:?}", self.send_timeout),
        }
    }

    fn bucket_or_create(&self, session_id: &str, target: &str) -> SharedBucket {
        let mut buckets = self.buckets.lock();
        Arc::clone(
            buckets
                .entry(session_id.to_string())
                .or_default()
                .entry(target.to_string())
                .or_default(),
        )
    }

    fn bucket(&self, session_id: &str, target: &str) -> Option<SharedBucket> {
        let buckets = self.buckets.lock();
        buckets.get(session_id)?.get(target).cloned()
    }

    /// Unlink `bucket` if it is still the one registered for the key.
    /// Caller holds the bucket lock and has marked it retired.
    fn unlink(&self, session_id: &str, target: &str, bucket: &SharedBucket) {
        let mut buckets = self.buckets.lock();
        let Some(targets) = buckets.get_mut(session_id) else {
            return;
        };
        if targets
            .get(target)
            .is_some_and(|current| Arc::ptr_eq(current, bucket))
        {
            targets.remove(target);
        }
        if targets.is_empty() {
            buckets.remove(session_id);
        }
    }

    /// Send the listener handshake, then register the connection.
    pub async fn subscribe(
        &self,
        session_id: &str,
        target: &str,
        conn: Arc<dyn OutputConnection>,
    ) -> anyhow::Result<()> {
        let handshake = OutputHandshake {
            session_id: session_id.to_string(),
            target: target.to_string(),
            sample_rate: self.sample_rate,
        };
        self.bounded(conn.send_text(serde_json::to_string(&handshake)?))
            .await?;

        loop {
            let bucket = self.bucket_or_create(session_id, target);
            let mut guard = bucket.lock().await;
            if guard.retired {
                // Lost a race with the last listener leaving; take a fresh bucket.
                continue;
            }
            guard.connections.push(Arc::clone(&conn));
            tracing::info!(
                session_id = %session_id,
                target_lang = %target,
                conn_id = conn.id(),
                listeners = guard.connections.len(),
                "Listener subscribed"
            );
            return Ok(());
        }
    }

    pub async fn unsubscribe(&self, session_id: &str, target: &str, conn_id: u64) {
        let Some(bucket) = self.bucket(session_id, target) else {
            return;
        };
        let mut guard = bucket.lock().await;
        let before = guard.connections.len();
        guard.connections.retain(|c| c.id() != conn_id);
        if guard.connections.len() != before {
            tracing::info!(
                session_id = %session_id,
                target_lang = %target,
                conn_id,
                "Listener unsubscribed"
            );
        }
        if guard.connections.is_empty() && !guard.retired {
            guard.retired = true;
            self.unlink(session_id, target, &bucket);
        }
    }

    /// Deliver one clip (metadata text, then audio binary) to every
    /// listener of (session, target). Connections that fail or time out
    /// on either send are dropped. Returns how many connections received the clip.
    pub async fn broadcast(
        &self,
        session_id: &str,
        target: &str,
        metadata: &ClipMetadata,
        audio: &[u8],
    ) -> usize {
        let Some(bucket) = self.bucket(session_id, target) else {
            tracing::info!(
                session_id = %session_id,
                target_lang = %target,
                segment_id = %metadata.segment_id,
                "No active listeners; audio dropped"
            );
            return 0;
        };

        let text = match serde_json::to_string(metadata) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode clip metadata");
                return 0;
            }
        };

        let mut guard = bucket.lock().await;
        let mut alive = Vec::with_capacity(guard.connections.len());
        for conn in std::mem::take(&mut guard.connections) {
            let delivered = match self.bounded(conn.send_text(text.clone())).await {
                Ok(()) => self.bounded(conn.send_binary(audio.to_vec())).await,
                Err(e) => Err(e),
            };
            match delivered {
                Ok(()) => alive.push(conn),
                Err(e) => tracing::info!(
                    session_id = %session_id,
                    target_lang = %target,
                    conn_id = conn.id(),
                    error = %e,
                    "Dropping closed client"
                ),
            }
        }
        guard.connections = alive;

        let delivered = guard.connections.len();
        if delivered == 0 {
            if !guard.retired {
                guard.retired = true;
                self.unlink(session_id, target, &bucket);
            }
            tracing::info!(
                session_id = %session_id,
                target_lang = %target,
                segment_id = %metadata.segment_id,
                "No active listeners; audio dropped"
            );
        }
        delivered
    }

    pub async fn listener_count(&self, session_id: &str, target: &str) -> usize {
        match self.bucket(session_id, target) {
            Some(bucket) => bucket.lock().await.connections.len(),
            None => 0,
        }
    }

    /// Sessions with at least one listener bucket.
    pub fn session_count(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
