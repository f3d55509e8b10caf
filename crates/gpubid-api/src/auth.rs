//! Session management
//!
//! Sessions are opaque in-memory tokens delivered as an HttpOnly cookie.
//! They are deliberately not persisted: a restart logs everyone out. Expiry
//! is enforced on access and swept by a timer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Session cookie name
pub const SESSION_COOKIE: &str = "gpubid_session";

struct Session {
    username: String,
    touched_at: Instant,
}

/// In-memory session table with a sliding TTL
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Duration,
}

impl SessionStore {
    /// Create a store with the given session lifetime
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Issue a new session token for a user
    pub async fn create(&self, username: &str) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.sessions.write().await.insert(
            token.clone(),
            Session {
                username: username.to_string(),
                touched_at: Instant::now(),
            },
        );
        token
    }

    /// Resolve a token to its username, renewing the TTL
    pub async fn resolve(&self, token: &str) -> Option<String> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(token)?;
        if session.touched_at.elapsed() > self.ttl {
            sessions.remove(token);
            return None;
        }
        session.touched_at = Instant::now();
        Some(session.username.clone())
    }

    /// Drop a session (logout)
    pub async fn destroy(&self, token: &str) {
        self.sessions.write().await.remove(token);
    }

    /// Sweep expired sessions; returns how many were dropped
    pub async fn purge_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.touched_at.elapsed() <= self.ttl);
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, "Expired sessions purged");
        }
        removed
    }
}

/// Extract the session token from a request's Cookie header
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

/// Set-Cookie value establishing a session
pub fn login_cookie(token: &str) -> String {
    format!("{}={}; Path=/; HttpOnly; SameSite=Lax", SESSION_COOKIE, token)
}

/// Set-Cookie value clearing the session
pub fn logout_cookie() -> String {
    format!(
        "{}=; Path=/; HttpOnly; Expires=Thu, 01 Jan 1970 00:00:00 GMT",
        SESSION_COOKIE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::COOKIE;

    #[tokio::test]
    async fn test_create_resolve_destroy() {
        let store = SessionStore::new(Duration::from_secs(60));
        let token = store.create("alice").await;
        assert_eq!(store.resolve(&token).await.as_deref(), Some("alice"));

        store.destroy(&token).await;
        assert_eq!(store.resolve(&token).await, None);
    }

    #[tokio::test]
    async fn test_expired_session_is_rejected() {
        let store = SessionStore::new(Duration::ZERO);
        let token = store.create("alice").await;
        assert_eq!(store.resolve(&token).await, None);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = SessionStore::new(Duration::ZERO);
        store.create("alice").await;
        store.create("bob").await;
        assert_eq!(store.purge_expired().await, 2);
        assert_eq!(store.purge_expired().await, 0);
    }

    #[test]
    fn test_session_token_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            format!("other=x; {}=tok123; theme=dark", SESSION_COOKIE)
                .parse()
                .unwrap(),
        );
        assert_eq!(session_token(&headers).as_deref(), Some("tok123"));

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "other=x".parse().unwrap());
        assert_eq!(session_token(&headers), None);
        assert_eq!(session_token(&HeaderMap::new()), None);
    }
}
