//! Credential checking and session tokens
//!
//! Two shared secrets select the role; successful password auth mints an
//! opaque random token that can be replayed across reconnects until its TTL
//! runs out. Expired entries are dropped lazily on the read path and in bulk
//! by a periodic sweep.

use std::sync::Arc;

use dashmap::DashMap;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tokio::task::AbortHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::AuthConfig;
use crate::models::{Role, Session};

/// Token length in bytes (256 bits of entropy, hex-encoded on the wire).
const TOKEN_LENGTH: usize = 32;

pub struct AuthStore {
    operator_password: String,
    viewer_password: String,
    session_ttl: Duration,
    sessions: DashMap<String, Session>,
}

impl std::fmt::Debug for AuthStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthStore")
            .field("session_ttl", &self.session_ttl)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl AuthStore {
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            operator_password: config.operator_password.clone(),
            viewer_password: config.viewer_password.clone(),
            session_ttl: Duration::from_millis(config.session_ttl_ms),
            sessions: DashMap::new(),
        }
    }

    /// Check a password against both configured secrets in constant time.
    /// The operator secret wins if the two are (mis)configured identically.
    #[must_use]
    pub fn validate_password(&self, password: &str) -> Option<Role> {
        let is_operator: bool = password
            .as_bytes()
            .ct_eq(self.operator_password.as_bytes())
            .into();
        let is_viewer: bool = password
            .as_bytes()
            .ct_eq(self.viewer_password.as_bytes())
            .into();
        if is_operator {
            Some(Role::Operator)
        } else if is_viewer {
            Some(Role::Viewer)
        } else {
            None
        }
    }

    /// Mint a session and return its token.
    pub fn create_session(&self, role: Role, name: String) -> String {
        let token = generate_token();
        let session = Session {
            token: token.clone(),
            role,
            name,
            expires_at: Instant::now() + self.session_ttl,
        };
        self.sessions.insert(token.clone(), session);
        debug!(role = %role, ttl = ?self.session_ttl, "session created");
        token
    }

    /// Look up a live session. Expired entries are removed on the way out;
    /// the re-check inside `remove_if` keeps a concurrent refresh safe.
    #[must_use]
    pub fn validate_session(&self, token: &str) -> Option<Session> {
        let now = Instant::now();
        let expired = match self.sessions.get(token) {
            Some(entry) if entry.expires_at > now => return Some(entry.value().clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.sessions.remove_if(token, |_, s| s.expires_at <= now);
        }
        None
    }

    pub fn invalidate_session(&self, token: &str) {
        if self.sessions.remove(token).is_some() {
            debug!("session invalidated");
        }
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.expires_at > now);
        before - self.sessions.len()
    }

    /// Run `sweep` on a fixed period until aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> AbortHandle {
        let store = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = store.sweep();
                if removed > 0 {
                    info!(removed, remaining = store.sessions.len(), "session sweep");
                }
            }
        })
        .abort_handle()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_LENGTH];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> AuthStore {
        AuthStore::new(&AuthConfig {
            operator_password: "op-secret".to_string(),
            viewer_password: "view-secret".to_string(),
            session_ttl_ms: 60_000,
            sweep_interval_ms: 3_600_000,
        })
    }

    #[test]
    fn password_selects_role() {
        let store = store();
        assert_eq!(store.validate_password("op-secret"), Some(Role::Operator));
        assert_eq!(store.validate_password("view-secret"), Some(Role::Viewer));
        assert_eq!(store.validate_password("wrong"), None);
        assert_eq!(store.validate_password(""), None);
    }

    #[test]
    fn tokens_are_hex_and_unique() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_LENGTH * 2);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }

    #[tokio::test(start_paused = true)]
    async fn token_round_trips_role_and_name() {
        let store = store();
        let token = store.create_session(Role::Operator, "Ana".to_string());

        let session = store.validate_session(&token).expect("live session");
        assert_eq!(session.role, Role::Operator);
        assert_eq!(session.name, "Ana");

        // Stable across repeated validations until the TTL runs out.
        assert!(store.validate_session(&token).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn token_expires_after_ttl() {
        let store = store();
        let token = store.create_session(Role::Viewer, "Bo".to_string());

        tokio::time::advance(Duration::from_millis(59_999)).await;
        assert!(store.validate_session(&token).is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(store.validate_session(&token).is_none());
        // Lazy expiry removed the entry.
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_token_is_rejected() {
        let store = store();
        assert!(store.validate_session("deadbeef").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_removes_session() {
        let store = store();
        let token = store.create_session(Role::Viewer, "Bo".to_string());
        store.invalidate_session(&token);
        assert!(store.validate_session(&token).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired() {
        let store = store();
        let stale = store.create_session(Role::Viewer, "old".to_string());
        tokio::time::advance(Duration::from_millis(30_000)).await;
        let fresh = store.create_session(Role::Viewer, "new".to_string());
        tokio::time::advance(Duration::from_millis(30_001)).await;

        assert_eq!(store.sweep(), 1);
        assert!(store.validate_session(&stale).is_none());
        assert!(store.validate_session(&fresh).is_some());
    }
}
