//
// Session registry.
//
// Three process-wide maps, each independently concurrent, holding cached
// broker sessions and in-flight-attempt records the UI polls without a
// per-flow handle. `DashMap`-keyed concurrent state gives each map its own
// locking instead of one coarse mutex over the whole registry. There is no
// ambient global here: `Registry` is an explicitly constructed service,
// cheap to clone (it's just three `Arc<DashMap<..>>`s), that callers pass
// into the OAuth/MitID/sync components. A test builds its own instance
// rather than sharing global state with other tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::session::{MitIDSession, OAuthSession, Session};

#[derive(Clone, Default)]
pub struct Registry {
    cached_sessions: Arc<DashMap<String, Session>>,
    active_oauth: Arc<DashMap<String, OAuthSession>>,
    active_mitid: Arc<DashMap<String, MitIDSession>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    //
    // cached_sessions
    //

    /// Returns `None` for a session within the 5-minute expiry buffer —
    /// callers must treat that as "refresh needed".
    pub fn get_cached_session(&self, connection_id: &str, now: DateTime<Utc>) -> Option<Session> {
        let entry = self.cached_sessions.get(connection_id)?;
        if entry.needs_refresh(now) {
            return None;
        }
        Some(entry.clone())
    }

    /// A no-op on `None`, so callers can pass through a fallible session
    /// builder without an extra branch.
    pub fn cache_session(&self, connection_id: &str, session: Option<Session>) {
        if let Some(session) = session {
            self.cached_sessions.insert(connection_id.to_string(), session);
        }
    }

    /// Idempotent: removing an absent entry is not an error.
    pub fn invalidate_cached_session(&self, connection_id: &str) {
        self.cached_sessions.remove(connection_id);
    }

    /// Returns whatever is cached regardless of freshness — used to find a
    /// stale-but-refreshable entry after `get_cached_session` has already
    /// returned `None`.
    pub fn peek_cached_session(&self, connection_id: &str) -> Option<Session> {
        self.cached_sessions.get(connection_id).map(|e| e.clone())
    }

    //
    // active_oauth
    //

    /// Returns `Err` with the existing session if one is active and fresher
    /// than `window_secs`; otherwise evicts any stale entry and returns
    /// `Ok`, leaving the caller to insert the new one.
    pub fn begin_oauth(&self, connection_id: &str, now: DateTime<Utc>, window_secs: i64) -> Result<(), OAuthSession> {
        if let Some(existing) = self.active_oauth.get(connection_id) {
            if !existing.is_stale(now, window_secs) {
                return Err(existing.clone());
            }
        }
        self.active_oauth.remove(connection_id);
        Ok(())
    }

    pub fn insert_oauth(&self, session: OAuthSession) {
        self.active_oauth.insert(session.connection_id.clone(), session);
    }

    pub fn get_oauth_status(&self, connection_id: &str) -> Option<String> {
        self.active_oauth.get(connection_id).map(|s| s.status.as_str().to_string())
    }

    pub fn get_oauth_url(&self, connection_id: &str) -> String {
        self.active_oauth.get(connection_id).map(|s| s.auth_url.clone()).unwrap_or_default()
    }

    pub fn update_oauth<F: FnOnce(&mut OAuthSession)>(&self, connection_id: &str, f: F) {
        if let Some(mut entry) = self.active_oauth.get_mut(connection_id) {
            f(&mut entry);
        }
    }

    /// Used by the upstream caller to force-retry after a stale failure.
    pub fn clear_active_oauth_session(&self, connection_id: &str) {
        self.active_oauth.remove(connection_id);
    }

    //
    // active_mitid
    //

    pub fn begin_mitid(&self, connection_id: &str, now: DateTime<Utc>, window_secs: i64) -> Result<(), MitIDSession> {
        if let Some(existing) = self.active_mitid.get(connection_id) {
            if !existing.is_stale(now, window_secs) {
                return Err(existing.clone());
            }
        }
        self.active_mitid.remove(connection_id);
        Ok(())
    }

    pub fn insert_mitid(&self, session: MitIDSession) {
        self.active_mitid.insert(session.connection_id.clone(), session);
    }

    pub fn get_mitid(&self, connection_id: &str) -> Option<MitIDSession> {
        self.active_mitid.get(connection_id).map(|s| s.clone())
    }

    pub fn clear_mitid(&self, connection_id: &str) {
        self.active_mitid.remove(connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::OAuthStatus;

    fn oauth_session(connection_id: &str, started_at: DateTime<Utc>) -> OAuthSession {
        OAuthSession {
            connection_id: connection_id.to_string(),
            state: "s".into(),
            verifier: None,
            app_key: "k".into(),
            app_secret: None,
            redirect_uri: "http://localhost:33847/callback".into(),
            started_at,
            status: OAuthStatus::Pending,
            auth_url: "https://example.invalid".into(),
            error_msg: None,
        }
    }

    #[test]
    fn cache_session_none_is_noop() {
        let registry = Registry::new();
        registry.cache_session("c1", None);
        assert!(registry.get_cached_session("c1", Utc::now()).is_none());
    }

    #[test]
    fn invalidate_cached_session_is_idempotent() {
        let registry = Registry::new();
        registry.invalidate_cached_session("nonexistent");
        registry.invalidate_cached_session("nonexistent");
    }

    #[test]
    fn begin_oauth_rejects_fresh_in_flight_attempt() {
        let registry = Registry::new();
        let now = Utc::now();
        registry.insert_oauth(oauth_session("c1", now));

        let result = registry.begin_oauth("c1", now, 90);
        assert!(result.is_err());
    }

    #[test]
    fn begin_oauth_evicts_stale_attempt() {
        let registry = Registry::new();
        let now = Utc::now();
        registry.insert_oauth(oauth_session("c1", now - chrono::Duration::seconds(91)));

        let result = registry.begin_oauth("c1", now, 90);
        assert!(result.is_ok());
        assert!(registry.get_oauth_status("c1").is_none());
    }

    #[test]
    fn clear_active_oauth_session_forces_retry() {
        let registry = Registry::new();
        let now = Utc::now();
        registry.insert_oauth(oauth_session("c1", now));
        registry.clear_active_oauth_session("c1");
        assert!(registry.begin_oauth("c1", now, 90).is_ok());
    }

    #[test]
    fn update_oauth_mutates_in_place() {
        let registry = Registry::new();
        let now = Utc::now();
        registry.insert_oauth(oauth_session("c1", now));
        registry.update_oauth("c1", |s| s.status = OAuthStatus::Complete);
        assert_eq!(registry.get_oauth_status("c1").as_deref(), Some("complete"));
    }
}
