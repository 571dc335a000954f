//! # Session Registry
//!
//! Owns every live `Session`, keyed by id.
//!
//! ## Concurrency:
//! - Lookups take the read lock and hand out `Arc<Session>` clones
//! - Creation and removal take the write lock
//! - Removal always `close()`s the session, which cancels its silence timer,
//!   so no timer can fire against a destroyed session's state

use super::{Session, SessionEvent, SessionSummary};
use crate::error::{AppError, AppResult};
use crate::providers::ProviderSnapshot;
use crate::turn::TurnSettings;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    settings: TurnSettings,
    provider_config: ProviderSnapshot,
    max_sessions: usize,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(
        settings: TurnSettings,
        provider_config: ProviderSnapshot,
        max_sessions: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            settings,
            provider_config,
            max_sessions,
            idle_timeout,
        }
    }

    /// Return the session for `session_id`, creating it if needed.
    ///
    /// A missing or blank id gets a fresh UUID. The boolean is true when the
    /// session was created by this call. Existing sessions can always be
    /// rejoined; only creation is subject to `max_sessions`.
    pub fn get_or_create(&self, session_id: Option<String>) -> AppResult<(Arc<Session>, bool)> {
        let session_id = session_id.filter(|id| !id.trim().is_empty());

        if let Some(id) = &session_id {
            if let Some(existing) = self.get(id) {
                existing.touch();
                return Ok((existing, false));
            }
        }

        let mut sessions = self.sessions.write();

        // Another caller may have created it between the two locks.
        if let Some(id) = &session_id {
            if let Some(existing) = sessions.get(id) {
                existing.touch();
                return Ok((Arc::clone(existing), false));
            }
        }

        if sessions.len() >= self.max_sessions {
            return Err(AppError::SessionLimit(format!(
                "Maximum concurrent sessions ({}) reached",
                self.max_sessions
            )));
        }

        let id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let session = Arc::new(Session::new(
            id.clone(),
            &self.settings,
            self.provider_config.clone(),
        ));
        sessions.insert(id.clone(), Arc::clone(&session));

        info!(session_id = %id, active = sessions.len(), "Created session");
        Ok((session, true))
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Remove and close a session, handing it back so the caller can notify
    /// the client.
    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.write().remove(session_id)?;
        session.close();
        debug!(session_id = %session_id, "Removed session");
        Some(session)
    }

    /// Destroy every session idle for strictly longer than the timeout.
    ///
    /// Each affected client receives `session_timeout` before removal.
    /// Returns the ids that were destroyed.
    pub fn sweep_idle(&self, now: Instant) -> Vec<String> {
        let mut sessions = self.sessions.write();

        let expired: Vec<String> = sessions
            .values()
            .filter(|s| s.idle_for(now) > self.idle_timeout)
            .map(|s| s.id.clone())
            .collect();

        for id in &expired {
            if let Some(session) = sessions.remove(id) {
                session.emit(SessionEvent::SessionTimeout {
                    session_id: id.clone(),
                });
                session.close();
                info!(
                    session_id = %id,
                    idle_secs = session.idle_for(now).as_secs(),
                    "Session expired"
                );
            }
        }

        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Number of sessions with a turn in the pipeline.
    pub fn busy_count(&self) -> usize {
        self.sessions.read().values().filter(|s| s.is_busy()).count()
    }

    /// Summaries of all sessions, oldest first.
    pub fn summaries(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        let mut summaries: Vec<SessionSummary> = sessions.iter().map(|s| s.summary()).collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn registry(max_sessions: usize) -> SessionRegistry {
        SessionRegistry::new(
            TurnSettings::default(),
            ProviderSnapshot {
                stt: "stt".to_string(),
                llm: "llm".to_string(),
                tts: "tts".to_string(),
            },
            max_sessions,
            Duration::from_secs(30 * 60),
        )
    }

    #[test]
    fn test_get_or_create_returns_existing() {
        let registry = registry(10);
        let (first, created) = registry.get_or_create(Some("s1".to_string())).unwrap();
        assert!(created);

        let (second, created) = registry.get_or_create(Some("s1".to_string())).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_generated_ids_are_uuids() {
        let registry = registry(10);
        let (session, _) = registry.get_or_create(None).unwrap();
        assert!(Uuid::parse_str(&session.id).is_ok());

        let (blank, _) = registry.get_or_create(Some("  ".to_string())).unwrap();
        assert!(Uuid::parse_str(&blank.id).is_ok());
    }

    #[test]
    fn test_capacity_limit_only_blocks_creation() {
        let registry = registry(1);
        registry.get_or_create(Some("s1".to_string())).unwrap();

        let err = registry.get_or_create(Some("s2".to_string())).unwrap_err();
        assert!(matches!(err, AppError::SessionLimit(_)));
        assert!(registry.get_or_create(Some("s1".to_string())).is_ok());
    }

    #[test]
    fn test_remove_closes_and_forgets() {
        let registry = registry(10);
        let (session, _) = registry.get_or_create(Some("s1".to_string())).unwrap();

        let removed = registry.remove("s1").unwrap();
        assert!(Arc::ptr_eq(&removed, &session));
        assert!(session.is_closed());
        assert!(registry.remove("s1").is_none());
        assert!(registry.get("s1").is_none());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_exactly_the_expired() {
        let registry = registry(10);
        let (old, _) = registry.get_or_create(Some("old".to_string())).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        old.attach_sink(tx);

        tokio::time::advance(Duration::from_secs(20 * 60)).await;
        registry.get_or_create(Some("fresh".to_string())).unwrap();
        tokio::time::advance(Duration::from_secs(10 * 60)).await;

        // Exactly at the timeout is not "exceeds".
        assert!(registry.sweep_idle(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        let expired = registry.sweep_idle(Instant::now());
        assert_eq!(expired, vec!["old".to_string()]);
        assert!(old.is_closed());
        assert!(registry.get("fresh").is_some());
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::SessionTimeout {
                session_id: "old".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_postpones_expiry() {
        let registry = registry(10);
        registry.get_or_create(Some("s1".to_string())).unwrap();

        tokio::time::advance(Duration::from_secs(29 * 60)).await;
        registry.get("s1").unwrap().touch();
        tokio::time::advance(Duration::from_secs(29 * 60)).await;

        assert!(registry.sweep_idle(Instant::now()).is_empty());
    }

    #[test]
    fn test_summaries_sorted_by_creation() {
        let registry = registry(10);
        for id in ["a", "b", "c"] {
            registry.get_or_create(Some(id.to_string())).unwrap();
        }
        let summaries = registry.summaries();
        assert_eq!(summaries.len(), 3);
        assert!(summaries
            .windows(2)
            .all(|pair| pair[0].created_at <= pair[1].created_at));
        assert_eq!(registry.busy_count(), 0);
    }
}
