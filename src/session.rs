use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::accumulator::Accumulator;
use crate::conversation::Message;
use crate::error::{ChatError, Result};

/// Conversation identity: a client-generated token until the backend assigns an id
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SessionKey {
    Ephemeral(String),
    Bound(String),
}

impl SessionKey {
    /// Fresh temporary key for a conversation the backend has not seen yet
    pub fn ephemeral() -> Self {
        SessionKey::Ephemeral(Uuid::new_v4().to_string())
    }

    pub fn bound(id: impl Into<String>) -> Self {
        SessionKey::Bound(id.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            SessionKey::Ephemeral(token) => token,
            SessionKey::Bound(id) => id,
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, SessionKey::Bound(_))
    }

    /// Backend id, if the conversation has one
    pub fn chat_id(&self) -> Option<&str> {
        match self {
            SessionKey::Bound(id) => Some(id),
            SessionKey::Ephemeral(_) => None,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKey::Ephemeral(token) => write!(f, "ephemeral:{}", token),
            SessionKey::Bound(id) => f.write_str(id),
        }
    }
}

static NEXT_READER_ID: AtomicU64 = AtomicU64::new(1);

/// Cancel handle of the read loop owned by a session
#[derive(Clone, Debug)]
pub struct ReaderHandle {
    id: u64,
    token: CancellationToken,
}

impl ReaderHandle {
    pub fn new() -> Self {
        Self {
            id: NEXT_READER_ID.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Takes effect at the next read boundary of the loop
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl Default for ReaderHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for ReaderHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// All live-or-cached state for one logical conversation
#[derive(Clone, Debug)]
pub struct Session {
    pub key: SessionKey,
    pub title: Option<String>,
    pub messages: Vec<Message>,
    pub streaming: bool,
    /// Present only while a stream is being read
    pub accumulator: Option<Accumulator>,
    reader: Option<ReaderHandle>,
    next_tool_key: u64,
    next_message_seq: u64,
}

impl Session {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            title: None,
            messages: Vec::new(),
            streaming: false,
            accumulator: None,
            reader: None,
            next_tool_key: 0,
            next_message_seq: 0,
        }
    }

    /// Session rebuilt from persisted rows; the tool-key sequence continues after the last block
    pub fn restored(
        key: SessionKey,
        title: impl Into<String>,
        messages: Vec<Message>,
        next_tool_key: u64,
    ) -> Self {
        Self {
            title: Some(title.into()),
            messages,
            next_tool_key,
            ..Self::new(key)
        }
    }

    /// Claim the next tool-block sequence key
    pub fn next_tool_key(&mut self) -> u64 {
        let key = self.next_tool_key;
        self.next_tool_key += 1;
        key
    }

    pub fn peek_tool_key(&self) -> u64 {
        self.next_tool_key
    }

    /// Id for a locally created message, replaced once the backend issues its own
    pub fn next_message_id(&mut self) -> String {
        let seq = self.next_message_seq;
        self.next_message_seq += 1;
        format!("{}-{}", self.key.as_str(), seq)
    }

    pub fn reader(&self) -> Option<&ReaderHandle> {
        self.reader.as_ref()
    }

    /// At most one reader per session
    pub fn register_reader(&mut self, reader: ReaderHandle) -> Result<()> {
        if self.reader.is_some() {
            return Err(ChatError::SessionBusy(self.key.to_string()));
        }
        self.reader = Some(reader);
        Ok(())
    }

    /// Release the reader if it is still the one with `id`
    pub fn release_reader(&mut self, id: u64) -> bool {
        match &self.reader {
            Some(reader) if reader.id() == id => {
                self.reader = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_reader_is_refused() {
        let mut session = Session::new(SessionKey::ephemeral());
        let first = ReaderHandle::new();
        session.register_reader(first.clone()).unwrap();
        let err = session.register_reader(ReaderHandle::new()).unwrap_err();
        assert!(matches!(err, ChatError::SessionBusy(_)));

        assert!(!session.release_reader(first.id() + 1000));
        assert!(session.release_reader(first.id()));
        assert!(session.reader().is_none());
    }

    #[test]
    fn test_tool_keys_increase() {
        let mut session = Session::new(SessionKey::bound("abc"));
        assert_eq!(session.next_tool_key(), 0);
        assert_eq!(session.next_tool_key(), 1);
        assert_eq!(session.peek_tool_key(), 2);
    }

    #[test]
    fn test_local_message_ids_use_key_token() {
        let mut session = Session::new(SessionKey::Ephemeral("tmp".into()));
        assert_eq!(session.next_message_id(), "tmp-0");
        assert_eq!(session.next_message_id(), "tmp-1");
    }

    #[test]
    fn test_key_display_and_chat_id() {
        let key = SessionKey::Ephemeral("t".into());
        assert_eq!(key.to_string(), "ephemeral:t");
        assert_eq!(key.chat_id(), None);
        assert_eq!(SessionKey::bound("abc").chat_id(), Some("abc"));
    }
}
