//! Session registry.
//!
//! One keyed store holding every conversation the process knows about. Each
//! entry is an `Arc<Session>` and every operation publishes a new map through a
//! `watch` channel, so a reader holding a snapshot never observes a half-written
//! session. Cloning the registry is cheap.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::conversation::Message;
use crate::session::{Session, SessionKey};

pub type SessionMap = HashMap<SessionKey, Arc<Session>>;

/// What the UI observes for one conversation
#[derive(Clone, Debug, PartialEq)]
pub struct SessionView {
    pub messages: Vec<Message>,
    pub streaming: bool,
}

#[derive(Clone)]
pub struct SessionRegistry {
    state: Arc<watch::Sender<Arc<SessionMap>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Arc::new(SessionMap::new()));
        Self {
            state: Arc::new(state),
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Current map. Later updates never alter the returned value.
    pub fn snapshot(&self) -> Arc<SessionMap> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<SessionMap>> {
        self.state.subscribe()
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.state.borrow().get(key).cloned()
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.state.borrow().contains_key(key)
    }

    pub fn view(&self, key: &SessionKey) -> Option<SessionView> {
        self.get(key).map(|session| SessionView {
            messages: session.messages.clone(),
            streaming: session.streaming,
        })
    }

    pub fn keys(&self) -> Vec<SessionKey> {
        self.state.borrow().keys().cloned().collect()
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    pub fn get_or_create(&self, key: &SessionKey) -> Arc<Session> {
        if let Some(session) = self.get(key) {
            return session;
        }
        let mut created = None;
        self.state.send_if_modified(|map| {
            if let Some(existing) = map.get(key) {
                created = Some(existing.clone());
                return false;
            }
            let session = Arc::new(Session::new(key.clone()));
            Arc::make_mut(map).insert(key.clone(), session.clone());
            created = Some(session);
            true
        });
        debug!(chat_id = %key, "session ready");
        created.unwrap_or_else(|| Arc::new(Session::new(key.clone())))
    }

    /// Insert `session` unless the key is already taken; returns the entry now stored
    pub fn insert_if_absent(&self, session: Session) -> Arc<Session> {
        let key = session.key.clone();
        let mut stored = None;
        self.state.send_if_modified(|map| {
            if let Some(existing) = map.get(&key) {
                stored = Some(existing.clone());
                return false;
            }
            let session = Arc::new(session);
            Arc::make_mut(map).insert(key.clone(), session.clone());
            stored = Some(session);
            true
        });
        stored.unwrap_or_else(|| Arc::new(Session::new(key)))
    }

    /// Replace the message list of `key`. Returns false when the session does not exist.
    pub fn update<F>(&self, key: &SessionKey, f: F) -> bool
    where
        F: FnOnce(&mut Vec<Message>),
    {
        self.update_session(key, |session| f(&mut session.messages))
            .is_some()
    }

    /// Run `f` against a private copy of the session and publish the copy.
    ///
    /// `f` runs while the registry is locked and must not call back into it.
    pub fn update_session<F, R>(&self, key: &SessionKey, f: F) -> Option<R>
    where
        F: FnOnce(&mut Session) -> R,
    {
        let mut output = None;
        self.state.send_if_modified(|map| {
            if !map.contains_key(key) {
                return false;
            }
            let map = Arc::make_mut(map);
            if let Some(entry) = map.get_mut(key) {
                output = Some(f(Arc::make_mut(entry)));
            }
            true
        });
        output
    }

    /// Flip the streaming flag of `key`. Returns false when the session does not exist.
    pub fn set_streaming(&self, key: &SessionKey, streaming: bool) -> bool {
        self.update_session(key, |session| session.streaming = streaming)
            .is_some()
    }

    /// Move the entry at `old` to `new` (messages, accumulator, streaming flag and
    /// reader) and delete `old`, as one published update.
    pub fn migrate(&self, old: &SessionKey, new: &SessionKey) -> bool {
        if old == new {
            return false;
        }
        let moved = self.state.send_if_modified(|map| {
            if !map.contains_key(old) {
                return false;
            }
            let map = Arc::make_mut(map);
            let Some(entry) = map.remove(old) else {
                return false;
            };
            let mut session = Arc::unwrap_or_clone(entry);
            session.key = new.clone();
            map.insert(new.clone(), Arc::new(session));
            true
        });
        if moved {
            debug!(from = %old, to = %new, "session migrated");
        }
        moved
    }

    pub fn remove(&self, key: &SessionKey) -> Option<Arc<Session>> {
        let mut removed = None;
        self.state.send_if_modified(|map| {
            if !map.contains_key(key) {
                return false;
            }
            removed = Arc::make_mut(map).remove(key);
            true
        });
        removed
    }
}
