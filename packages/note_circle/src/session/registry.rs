//! Session registry
//!
//! Concurrent in-memory store of active sessions, indexed both by internal
//! id and by human-facing join code. The two indexes are only ever mutated
//! together under the same write lock. A background sweep evicts abandoned
//! and expired sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics::ServerMetrics;

use super::error::SessionError;
use super::session::{Phase, Session};

/// Join codes draw from the base32 alphabet: unambiguous, human-typable.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
const CODE_LEN: usize = 6;

#[derive(Default)]
struct Indexes {
    by_id: HashMap<String, Arc<Session>>,
    by_code: HashMap<String, Arc<Session>>,
}

/// Owns the lifetime of every active session.
pub struct SessionRegistry {
    inner: RwLock<Indexes>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Indexes::default()),
        }
    }

    /// Create and store a new session, generating a join code that is unique
    /// among active sessions (regenerating on collision).
    pub async fn create(&self, host_name: &str) -> Arc<Session> {
        let mut inner = self.inner.write().await;

        let code = loop {
            let candidate = generate_join_code();
            if !inner.by_code.contains_key(&candidate) {
                break candidate;
            }
            debug!(code = %candidate, "join code collision, regenerating");
        };

        let session = Arc::new(Session::new(host_name, code.clone()));
        inner.by_id.insert(session.id.clone(), session.clone());
        inner.by_code.insert(code, session.clone());

        info!(
            session = %session.code,
            id = %session.id,
            total = inner.by_id.len(),
            "session created"
        );
        session
    }

    pub async fn get_by_id(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
        self.inner
            .read()
            .await
            .by_id
            .get(session_id)
            .cloned()
            .ok_or(SessionError::NotFound("session"))
    }

    /// Look up by join code, case-insensitively.
    pub async fn get_by_code(&self, code: &str) -> Result<Arc<Session>, SessionError> {
        let normalized = normalize_code(code);
        self.inner
            .read()
            .await
            .by_code
            .get(&normalized)
            .cloned()
            .ok_or(SessionError::NotFound("session"))
    }

    /// Delete a session from both indexes atomically.
    pub async fn remove(&self, session_id: &str) -> Result<(), SessionError> {
        let mut inner = self.inner.write().await;

        let session = inner
            .by_id
            .remove(session_id)
            .ok_or(SessionError::NotFound("session"))?;
        inner.by_code.remove(&normalize_code(&session.code));
        Ok(())
    }

    pub async fn active_count(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    /// One sweep pass: evict sessions with no participants and COMPLETE
    /// sessions older than the retention window. Each decision is taken from
    /// the session's own consistent snapshot. Returns the eviction count.
    pub async fn sweep_once(&self, retention: Duration) -> usize {
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        let mut doomed: Vec<(String, String, &'static str, i64)> = Vec::new();
        for (id, session) in inner.by_id.iter() {
            let view = session.sweep_view().await;
            let age_secs = now.signed_duration_since(session.created_at).num_seconds();
            if view.participant_count == 0 {
                doomed.push((id.clone(), session.code.clone(), "abandoned", age_secs));
            } else if view.phase == Phase::Complete {
                let expired = view.completed_at.is_some_and(|done| {
                    now.signed_duration_since(done)
                        .to_std()
                        .is_ok_and(|age| age > retention)
                });
                if expired {
                    doomed.push((id.clone(), session.code.clone(), "retention expired", age_secs));
                }
            }
        }

        for (id, code, reason, age_secs) in &doomed {
            inner.by_id.remove(id);
            inner.by_code.remove(&normalize_code(code));
            info!(session = %code, reason = %reason, age_secs, "session evicted");
        }
        doomed.len()
    }

    /// Periodic sweep loop. Runs until the shutdown token fires.
    pub async fn run_sweeper(
        self: Arc<Self>,
        every: Duration,
        retention: Duration,
        metrics: Arc<ServerMetrics>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        info!(every_secs = every.as_secs(), "session sweep started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("session sweep stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = self.sweep_once(retention).await;
                    if removed > 0 {
                        for _ in 0..removed {
                            metrics.session_evicted();
                        }
                        let remaining = self.active_count().await;
                        info!(removed, remaining, "session sweep complete");
                    }
                }
            }
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

fn generate_join_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}
