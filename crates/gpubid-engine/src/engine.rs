//! The engine: owner of the in-memory document and its durability
//!
//! Every component receives the shared state through this struct; there are
//! no process-wide statics. Mutating operations follow one shape: take slot
//! locks (sorted) where slots are involved, take the document write lock,
//! validate, mutate, persist. A failed persist restores the pre-mutation
//! document so disk and memory never diverge.

use std::collections::BTreeMap;

use tokio::sync::RwLock;
use tracing::{error, info};

use gpubid_core::{
    password, Clock, Document, Role, SchedError, SchedResult, User,
};
use gpubid_store::Store;

use crate::locks::SlotLockRegistry;
use crate::view::UserSummary;

/// Transient monitor snapshot for the current hour; never persisted
#[derive(Debug, Clone, Default)]
pub struct LiveUsage {
    /// gpu index -> usernames observed in the latest report
    pub usage: BTreeMap<u32, Vec<String>>,
    /// Server receive time of the latest report, ISO-8601
    pub timestamp: Option<String>,
}

/// The scheduler engine
pub struct Engine {
    pub(crate) doc: RwLock<Document>,
    pub(crate) store: Store,
    pub(crate) clock: Clock,
    pub(crate) locks: SlotLockRegistry,
    pub(crate) live: RwLock<LiveUsage>,
}

impl Engine {
    /// Create an engine around a loaded (or freshly seeded) document
    pub fn new(store: Store, clock: Clock, doc: Document) -> Self {
        Self {
            doc: RwLock::new(doc),
            store,
            clock,
            locks: SlotLockRegistry::new(),
            live: RwLock::new(LiveUsage::default()),
        }
    }

    /// The engine's clock
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Session lifetime from the document config
    pub async fn session_ttl_seconds(&self) -> u64 {
        self.doc.read().await.config.session_ttl_seconds
    }

    /// Clone of the current document (backups, inspection)
    pub async fn snapshot(&self) -> Document {
        self.doc.read().await.clone()
    }

    /// Persist `doc`; on failure restore the pre-mutation snapshot and
    /// surface the storage error.
    pub(crate) async fn persist_or_rollback(
        &self,
        doc: &mut Document,
        before: Document,
    ) -> SchedResult<()> {
        match self.store.persist(doc).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "State write failed; rolling back in-memory mutation");
                *doc = before;
                Err(e)
            }
        }
    }

    /// Verify credentials and record the login. Uniform error on any failure.
    pub async fn authenticate(&self, username: &str, password_input: &str) -> SchedResult<UserSummary> {
        let mut doc = self.doc.write().await;
        let ok = doc
            .users
            .get(username)
            .filter(|u| u.enabled)
            .map(|u| password::verify_password(password_input, &u.salt, &u.password_hash))
            .unwrap_or(false);
        if !ok {
            return Err(SchedError::Unauthorized);
        }

        let before = doc.clone();
        let now = self.clock.now().to_rfc3339();
        if let Some(user) = doc.users.get_mut(username) {
            user.last_login = Some(now);
        }
        self.persist_or_rollback(&mut doc, before).await?;

        info!(user = username, "Login");
        Ok(crate::view::user_summary(&doc, &doc.users[username]))
    }

    /// Resolve a session's user, rejecting unknown or disabled accounts
    pub async fn session_user(&self, username: &str) -> SchedResult<(String, Role)> {
        let doc = self.doc.read().await;
        doc.users
            .get(username)
            .filter(|u| u.enabled)
            .map(|u| (u.username.clone(), u.role))
            .ok_or(SchedError::Unauthorized)
    }

    /// Change the caller's own password
    pub async fn change_password(&self, username: &str, old: &str, new: &str) -> SchedResult<()> {
        if new.is_empty() {
            return Err(SchedError::Validation("Password is required".to_string()));
        }
        let mut doc = self.doc.write().await;
        let user = doc
            .users
            .get(username)
            .ok_or(SchedError::Unauthorized)?;
        if !password::verify_password(old, &user.salt, &user.password_hash) {
            return Err(SchedError::Validation("Old password is incorrect".to_string()));
        }

        let before = doc.clone();
        let (salt, hash) = password::hash_password(new);
        let user = doc
            .users
            .get_mut(username)
            .ok_or(SchedError::Unauthorized)?;
        user.salt = salt;
        user.password_hash = hash;
        self.persist_or_rollback(&mut doc, before).await
    }

    /// Seed a fresh document with a default admin account
    pub fn seed_document(mut doc: Document) -> Document {
        let (salt, hash) = password::hash_password("admin");
        doc.users.insert(
            "admin".to_string(),
            User::new("admin", hash, salt, Role::Admin, 100),
        );
        doc
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::America::New_York;
    use chrono_tz::Tz;
    use gpubid_core::ScheduleConfig;
    use rust_decimal::Decimal;

    /// 2025-08-02 10:30 ET, transition hour 0
    pub fn test_now() -> chrono::DateTime<Tz> {
        New_York.with_ymd_and_hms(2025, 8, 2, 10, 30, 0).unwrap()
    }

    pub fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> chrono::DateTime<Tz> {
        New_York.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    pub fn test_user(name: &str, balance: u32) -> User {
        let mut user = User::new(name, String::new(), String::new(), Role::User, balance);
        user.balance = Decimal::from(balance);
        user
    }

    /// Engine over a tempdir store with users alice and bob (balance 10,
    /// budget 10), frozen at [`test_now`], days initialized by one tick.
    pub async fn test_engine() -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let clock = Clock::fixed(test_now());

        let mut doc = Document::new(ScheduleConfig::default());
        doc.users.insert("alice".to_string(), test_user("alice", 10));
        doc.users.insert("bob".to_string(), test_user("bob", 10));

        let engine = Engine::new(store, clock, doc);
        engine.tick().await.unwrap();
        (engine, dir)
    }

    pub async fn balance_of(engine: &Engine, user: &str) -> Decimal {
        engine.doc.read().await.users[user].balance
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::test_engine;
    use super::*;
    use gpubid_core::DayStatus;

    #[tokio::test]
    async fn test_tick_initializes_calendar() {
        let (engine, _dir) = test_engine().await;
        let doc = engine.doc.read().await;

        let executing = doc.days_with_status(DayStatus::Executing);
        assert_eq!(executing, vec!["2025-08-02".to_string()]);

        let open = doc.days_with_status(DayStatus::Open);
        assert_eq!(open.len(), 6);
        assert_eq!(open[0], "2025-08-03");
        assert_eq!(open[5], "2025-08-08");
    }

    #[tokio::test]
    async fn test_seed_document_creates_admin() {
        let doc = Engine::seed_document(Document::new(Default::default()));
        let admin = &doc.users["admin"];
        assert!(admin.is_admin());
        assert!(password::verify_password("admin", &admin.salt, &admin.password_hash));
    }

    #[tokio::test]
    async fn test_session_user_rejects_unknown() {
        let (engine, _dir) = test_engine().await;
        assert!(matches!(
            engine.session_user("mallory").await,
            Err(SchedError::Unauthorized)
        ));
        assert!(engine.session_user("alice").await.is_ok());
    }
}
