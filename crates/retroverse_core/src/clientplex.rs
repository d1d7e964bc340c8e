//! Client sessions, their subscriptions and their push queues.
//!
//! Every session has its own mutex guarding subscriptions, the push queue,
//! the permissions-changed flag and the long-poll waiter, so a push and a
//! drain of the same session are atomic with respect to each other while
//! unrelated sessions never contend.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::daton::Daton;
use crate::error::ErrorCode;
use crate::key::DatonKey;
use crate::permissions::{PermissionResolver, User};
use crate::schema::DataDictionary;
use crate::util::generate_token;

struct SessionState {
    last_access: Instant,
    /// record key -> version last delivered to the client
    subscriptions: HashMap<String, Option<String>>,
    push_queue: Vec<Daton>,
    permissions_changed: bool,
    waiter: Option<oneshot::Sender<()>>,
}

impl SessionState {
    fn wake(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            // The receiver may have timed out already
            let _ = waiter.send(());
        }
    }
}

struct ClientSession {
    user: User,
    state: Mutex<SessionState>,
}

/// Items drained from a session's push queue
#[derive(Debug, Default)]
pub struct PushItems {
    pub datons: Vec<Daton>,
    pub permissions_changed: bool,
}

impl PushItems {
    pub fn is_empty(&self) -> bool {
        self.datons.is_empty() && !self.permissions_changed
    }
}

/// Registry of client sessions
#[derive(Default)]
pub struct ClientPlex {
    sessions: DashMap<String, Arc<ClientSession>>,
}

impl ClientPlex {
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&self, session_key: &str) -> Option<Arc<ClientSession>> {
        self.sessions.get(session_key).map(|s| s.value().clone())
    }

    /// Register a session for `user` and return its key
    pub fn create_session(&self, user: User) -> String {
        let session_key = generate_token(24);
        log::debug!("Creating session for user {}", user.id);
        self.sessions.insert(
            session_key.clone(),
            Arc::new(ClientSession {
                user,
                state: Mutex::new(SessionState {
                    last_access: Instant::now(),
                    subscriptions: HashMap::new(),
                    push_queue: Vec::new(),
                    permissions_changed: false,
                    waiter: None,
                }),
            }),
        );
        session_key
    }

    pub fn delete_session(&self, session_key: &str) {
        if let Some((_, session)) = self.sessions.remove(session_key) {
            session.state.lock().wake();
        }
    }

    /// User behind a session; also keeps the session from idling out
    pub fn get_user(&self, session_key: &str) -> Option<User> {
        let session = self.session(session_key)?;
        session.state.lock().last_access = Instant::now();
        Some(session.user.clone())
    }

    /// Add or remove a subscription. New records and query keys cannot be
    /// subscribed to. Subscribing again without a version keeps the version
    /// already recorded.
    pub fn manage_subscribe(
        &self,
        session_key: &str,
        key: &DatonKey,
        version: Option<&str>,
        subscribe: bool,
    ) -> Result<(), ErrorCode> {
        let session = self.session(session_key).ok_or(ErrorCode::BadSession)?;
        let mut state = session.state.lock();
        if subscribe {
            if key.is_new() || !key.is_record() {
                return Err(ErrorCode::Internal);
            }
            let known = state.subscriptions.entry(key.to_string()).or_default();
            if let Some(version) = version {
                *known = Some(version.to_string());
            }
        } else {
            state.subscriptions.remove(key.as_str());
        }
        Ok(())
    }

    pub fn is_subscribed(&self, session_key: &str, key: &DatonKey) -> bool {
        self.session(session_key)
            .is_some_and(|s| s.state.lock().subscriptions.contains_key(key.as_str()))
    }

    /// Record that a session already holds `version` of `key`, if subscribed
    pub fn set_subscription_version(&self, session_key: &str, key: &DatonKey, version: &str) {
        if let Some(session) = self.session(session_key) {
            let mut state = session.state.lock();
            if let Some(known) = state.subscriptions.get_mut(key.as_str()) {
                *known = Some(version.to_string());
            }
        }
    }

    /// Whether any session subscribed to `key` knows a version other than `version`
    pub fn needs_refresh(&self, key: &DatonKey, version: &str) -> bool {
        self.sessions.iter().any(|entry| {
            let state = entry.value().state.lock();
            matches!(state.subscriptions.get(key.as_str()), Some(known) if known.as_deref() != Some(version))
        })
    }

    /// Forget every subscription to `key` (the record no longer exists)
    pub fn drop_subscriptions_to(&self, key: &DatonKey) {
        for entry in self.sessions.iter() {
            entry.value().state.lock().subscriptions.remove(key.as_str());
        }
    }

    /// Queue permission-filtered copies of changed datons for every session
    /// subscribed to them at a different version, and wake those sessions.
    pub fn notify_clients_of(
        &self,
        schema: &DataDictionary,
        permissions: &dyn PermissionResolver,
        changed: &[Arc<Daton>],
    ) {
        for entry in self.sessions.iter() {
            let session = entry.value();
            let mut state = session.state.lock();
            let mut pushed = 0;
            for daton in changed {
                let Some(known) = state.subscriptions.get_mut(daton.key.as_str()) else {
                    continue;
                };
                if *known == daton.version {
                    continue;
                }
                *known = daton.version.clone();
                let mut copy = Daton::clone(daton);
                if let Some(def) = schema.find_def_for(&copy.key) {
                    permissions.hide_private_parts(&session.user, def, &mut copy);
                }
                state.push_queue.push(copy);
                pushed += 1;
            }
            if pushed > 0 {
                log::debug!("Queued {} datons for session of user {}", pushed, session.user.id);
                state.wake();
            }
        }
    }

    /// Flag every session of `user_id` so its next long poll carries fresh
    /// permissions
    pub fn notify_clients_of_permission_change(&self, user_id: &str) {
        for entry in self.sessions.iter() {
            let session = entry.value();
            if session.user.id == user_id {
                let mut state = session.state.lock();
                state.permissions_changed = true;
                state.wake();
            }
        }
    }

    /// Install a waiter that fires on the session's next push. Replaces (and
    /// thereby releases) any earlier waiter of the same session.
    pub fn begin_long_poll(&self, session_key: &str) -> Option<oneshot::Receiver<()>> {
        let session = self.session(session_key)?;
        let (tx, rx) = oneshot::channel();
        let mut state = session.state.lock();
        state.last_access = Instant::now();
        state.waiter = Some(tx);
        Some(rx)
    }

    /// Drain the push queue and the permissions flag in one step
    pub fn get_and_clear_items_to_push(&self, session_key: &str) -> Option<PushItems> {
        let session = self.session(session_key)?;
        let mut state = session.state.lock();
        state.last_access = Instant::now();
        Some(PushItems {
            datons: std::mem::take(&mut state.push_queue),
            permissions_changed: std::mem::take(&mut state.permissions_changed),
        })
    }

    /// Remove sessions idle for at least `older_than`, calling `on_removed`
    /// with each removed session key
    pub fn clean(&self, older_than: Duration, mut on_removed: impl FnMut(&str)) -> usize {
        let idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().state.lock().last_access.elapsed() >= older_than)
            .map(|entry| entry.key().clone())
            .collect();
        for session_key in &idle {
            self.delete_session(session_key);
            on_removed(session_key);
        }
        if !idle.is_empty() {
            log::info!("Removed {} idle sessions", idle.len());
        }
        idle.len()
    }

    /// Union of every session's subscribed keys
    pub fn get_subscriptions(&self) -> HashSet<String> {
        let mut keys = HashSet::new();
        for entry in self.sessions.iter() {
            keys.extend(entry.value().state.lock().subscriptions.keys().cloned());
        }
        keys
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::AllowAll;

    fn changed(key: &str, version: &str) -> Arc<Daton> {
        Arc::new(Daton::new(DatonKey::parse(key).unwrap()).with_version(version))
    }

    #[test]
    fn test_sessions() {
        let plex = ClientPlex::new();
        let session = plex.create_session(User::new("ann"));
        assert_eq!(plex.get_user(&session).unwrap().id, "ann");
        assert!(plex.get_user("nope").is_none());

        plex.delete_session(&session);
        assert!(plex.get_user(&session).is_none());
        assert_eq!(plex.session_count(), 0);
    }

    #[test]
    fn test_manage_subscribe_rules() {
        let plex = ClientPlex::new();
        let session = plex.create_session(User::new("ann"));
        let key = DatonKey::record("Customer", "5");

        plex.manage_subscribe(&session, &key, Some("v1"), true).unwrap();
        assert!(plex.is_subscribed(&session, &key));
        assert!(plex.get_subscriptions().contains("Customer|=5"));

        assert!(plex.manage_subscribe(&session, &DatonKey::new_record("Customer"), None, true).is_err());
        assert_eq!(
            plex.manage_subscribe("nope", &key, None, true),
            Err(ErrorCode::BadSession)
        );

        plex.manage_subscribe(&session, &key, None, false).unwrap();
        assert!(plex.get_subscriptions().is_empty());
    }

    #[test]
    fn test_push_delivered_once_and_only_when_version_differs() {
        let plex = ClientPlex::new();
        let schema = DataDictionary::default();
        let session = plex.create_session(User::new("ann"));
        let other = plex.create_session(User::new("bob"));
        let key = DatonKey::record("Customer", "5");
        plex.manage_subscribe(&session, &key, Some("v1"), true).unwrap();

        plex.notify_clients_of(&schema, &AllowAll, &[changed("Customer|=5", "v1")]);
        assert!(plex.get_and_clear_items_to_push(&session).unwrap().is_empty());

        plex.notify_clients_of(&schema, &AllowAll, &[changed("Customer|=5", "v2")]);
        plex.notify_clients_of(&schema, &AllowAll, &[changed("Customer|=5", "v2")]);
        let items = plex.get_and_clear_items_to_push(&session).unwrap();
        assert_eq!(items.datons.len(), 1);
        assert_eq!(items.datons[0].version.as_deref(), Some("v2"));
        assert!(plex.get_and_clear_items_to_push(&session).unwrap().is_empty());
        assert!(plex.get_and_clear_items_to_push(&other).unwrap().is_empty());

        assert!(plex.needs_refresh(&key, "v3"));
        assert!(!plex.needs_refresh(&key, "v2"));
    }

    #[tokio::test]
    async fn test_long_poll_waiter_wakes_on_push() {
        let plex = ClientPlex::new();
        let session = plex.create_session(User::new("ann"));
        plex.manage_subscribe(&session, &DatonKey::record("Customer", "5"), Some("v1"), true)
            .unwrap();

        let waiter = plex.begin_long_poll(&session).unwrap();
        plex.notify_clients_of(
            &DataDictionary::default(),
            &AllowAll,
            &[changed("Customer|=5", "v2")],
        );
        waiter.await.unwrap();
        assert_eq!(plex.get_and_clear_items_to_push(&session).unwrap().datons.len(), 1);
    }

    #[tokio::test]
    async fn test_permission_change_wakes_users_sessions() {
        let plex = ClientPlex::new();
        let ann = plex.create_session(User::new("ann"));
        let bob = plex.create_session(User::new("bob"));
        let waiter = plex.begin_long_poll(&ann).unwrap();

        plex.notify_clients_of_permission_change("ann");
        waiter.await.unwrap();
        assert!(plex.get_and_clear_items_to_push(&ann).unwrap().permissions_changed);
        assert!(!plex.get_and_clear_items_to_push(&bob).unwrap().permissions_changed);
    }

    #[test]
    fn test_clean_reports_removed_sessions() {
        let plex = ClientPlex::new();
        let session = plex.create_session(User::new("ann"));
        let mut removed = Vec::new();

        assert_eq!(plex.clean(Duration::from_secs(3600), |s| removed.push(s.to_string())), 0);
        assert_eq!(plex.clean(Duration::ZERO, |s| removed.push(s.to_string())), 1);
        assert_eq!(removed, vec![session]);
    }
}
