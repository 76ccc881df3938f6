//! Mid-turn interactive requests: OAuth-style authorization and elicitation forms.

use std::collections::VecDeque;

use reqwest::Url;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ChatError, Result};
use crate::protocol::ElicitationRequestContent;

/// Authorization waiting for the user's decision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingAuthorization {
    pub tool_name: String,
    pub auth_url: String,
    /// Opaque `state` query parameter of the authorization URL
    pub state: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AuthState {
    #[default]
    Idle,
    /// Tool registry reload in flight
    AwaitingReload,
    PromptingUser(PendingAuthorization),
    /// External authorization surface is open
    Authorizing,
}

/// Guarded authorization state machine.
///
/// `Idle -> AwaitingReload -> PromptingUser -> Authorizing -> Idle`
#[derive(Debug, Default)]
pub struct AuthorizationFlow {
    state: AuthState,
}

impl AuthorizationFlow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    /// Handle `authentication_required`. Returns false when the prompt is ignored.
    pub fn begin(&mut self) -> bool {
        match self.state {
            AuthState::Idle | AuthState::PromptingUser(_) => {
                self.state = AuthState::AwaitingReload;
                true
            }
            AuthState::AwaitingReload | AuthState::Authorizing => {
                debug!(state = ?self.state, "authorization already in progress");
                false
            }
        }
    }

    /// Tool registry reload finished. Without a `state` token the flow silently returns to idle.
    pub fn reloaded(&mut self, tool_name: &str, auth_url: &str) -> Option<PendingAuthorization> {
        if self.state != AuthState::AwaitingReload {
            return None;
        }
        match state_token(auth_url) {
            Ok(state) => {
                let pending = PendingAuthorization {
                    tool_name: tool_name.to_string(),
                    auth_url: auth_url.to_string(),
                    state,
                };
                self.state = AuthState::PromptingUser(pending.clone());
                Some(pending)
            }
            Err(e) => {
                debug!(tool = %tool_name, error = %e, "authorization dropped");
                self.state = AuthState::Idle;
                None
            }
        }
    }

    /// User accepted; the caller opens the authorization surface
    pub fn confirm(&mut self) -> Option<PendingAuthorization> {
        match std::mem::take(&mut self.state) {
            AuthState::PromptingUser(pending) => {
                self.state = AuthState::Authorizing;
                Some(pending)
            }
            other => {
                self.state = other;
                None
            }
        }
    }

    /// User declined; the caller sends the cancel callback with the returned state token
    pub fn cancel(&mut self) -> Option<PendingAuthorization> {
        match std::mem::take(&mut self.state) {
            AuthState::PromptingUser(pending) => Some(pending),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Any non-interactive event ends an authorization round trip
    pub fn observe_event(&mut self) {
        if self.state == AuthState::Authorizing {
            self.state = AuthState::Idle;
        }
    }
}

/// `state` query parameter of an authorization URL
pub fn state_token(auth_url: &str) -> Result<String> {
    let url = Url::parse(auth_url).map_err(|e| {
        warn!(error = %e, "unparseable authorization URL");
        ChatError::InvalidAuthUrl(format!("{}: {}", auth_url, e))
    })?;
    url.query_pairs()
        .find(|(name, _)| name == "state")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ChatError::InvalidAuthUrl(format!("{}: no state parameter", auth_url)))
}

/// Structured form request awaiting the user
#[derive(Clone, Debug, PartialEq)]
pub struct ElicitationRequest {
    pub request_id: String,
    pub message: String,
    pub schema: Value,
}

impl From<ElicitationRequestContent> for ElicitationRequest {
    fn from(content: ElicitationRequestContent) -> Self {
        Self {
            request_id: content.request_id,
            message: content.message,
            schema: content.requested_schema,
        }
    }
}

/// Global FIFO of pending elicitations, shared by every session
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ElicitationQueue {
    pending: VecDeque<ElicitationRequest>,
}

impl ElicitationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request ids are unique; a repeated id replaces the queued request in place
    pub fn push(&mut self, request: ElicitationRequest) {
        match self
            .pending
            .iter_mut()
            .find(|queued| queued.request_id == request.request_id)
        {
            Some(queued) => *queued = request,
            None => self.pending.push_back(request),
        }
    }

    pub fn remove(&mut self, request_id: &str) -> Option<ElicitationRequest> {
        let index = self
            .pending
            .iter()
            .position(|queued| queued.request_id == request_id)?;
        self.pending.remove(index)
    }

    /// Empty the queue, returning its entries in order
    pub fn drain_all(&mut self) -> Vec<ElicitationRequest> {
        self.pending.drain(..).collect()
    }

    pub fn front(&self) -> Option<&ElicitationRequest> {
        self.pending.front()
    }

    pub fn ids(&self) -> Vec<String> {
        self.pending.iter().map(|r| r.request_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const AUTH_URL: &str = "https://auth.example.com/authorize?client_id=x&state=tok123";

    #[test]
    fn test_full_authorization_round_trip() {
        let mut flow = AuthorizationFlow::new();
        assert!(flow.begin());
        assert_eq!(flow.state(), &AuthState::AwaitingReload);

        let pending = flow.reloaded("github", AUTH_URL).unwrap();
        assert_eq!(pending.state, "tok123");
        assert!(matches!(flow.state(), AuthState::PromptingUser(_)));

        assert_eq!(flow.confirm(), Some(pending));
        assert_eq!(flow.state(), &AuthState::Authorizing);

        // repeated prompts during the round trip are ignored
        assert!(!flow.begin());

        flow.observe_event();
        assert_eq!(flow.state(), &AuthState::Idle);
    }

    #[test]
    fn test_state_token_errors() {
        assert_eq!(state_token(AUTH_URL).unwrap(), "tok123");
        assert!(matches!(
            state_token("https://auth.example.com/authorize?state="),
            Err(ChatError::InvalidAuthUrl(_))
        ));
        assert!(matches!(
            state_token("not a url"),
            Err(ChatError::InvalidAuthUrl(_))
        ));
    }

    #[test]
    fn test_missing_state_cancels_silently() {
        let mut flow = AuthorizationFlow::new();
        flow.begin();
        assert!(flow
            .reloaded("github", "https://auth.example.com/authorize")
            .is_none());
        assert_eq!(flow.state(), &AuthState::Idle);
    }

    #[test]
    fn test_cancel_returns_state_and_resets() {
        let mut flow = AuthorizationFlow::new();
        flow.begin();
        flow.reloaded("github", AUTH_URL);
        let pending = flow.cancel().unwrap();
        assert_eq!(pending.state, "tok123");
        assert_eq!(flow.state(), &AuthState::Idle);
        assert!(flow.cancel().is_none());
    }

    #[test]
    fn test_confirm_outside_prompt_is_noop() {
        let mut flow = AuthorizationFlow::new();
        assert!(flow.confirm().is_none());
        flow.begin();
        assert!(flow.confirm().is_none());
        assert_eq!(flow.state(), &AuthState::AwaitingReload);
    }

    #[test]
    fn test_observe_event_only_clears_authorizing() {
        let mut flow = AuthorizationFlow::new();
        flow.begin();
        flow.observe_event();
        assert_eq!(flow.state(), &AuthState::AwaitingReload);
    }

    #[test]
    fn test_queue_is_fifo_and_removes_by_id() {
        let mut queue = ElicitationQueue::new();
        for id in ["r1", "r2", "r3"] {
            queue.push(ElicitationRequest {
                request_id: id.into(),
                message: String::new(),
                schema: json!({}),
            });
        }
        assert_eq!(queue.front().unwrap().request_id, "r1");
        assert!(queue.remove("r2").is_some());
        assert!(queue.remove("r2").is_none());
        assert_eq!(queue.ids(), vec!["r1", "r3"]);
        assert_eq!(queue.drain_all().len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_keeps_ids_unique() {
        let mut queue = ElicitationQueue::new();
        let request = ElicitationRequest {
            request_id: "r1".into(),
            message: "first".into(),
            schema: json!({}),
        };
        queue.push(request.clone());
        queue.push(ElicitationRequest {
            message: "second".into(),
            ..request
        });
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.front().unwrap().message, "second");
    }
}
