//! Streaming session engine.
//!
//! `ChatEngine` is the imperative surface (send, retry, edit, abort, load,
//! delete) over the session registry. Every stream runs in its own task that
//! owns the read loop for one conversation; the registry is the only state the
//! tasks share.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::accumulator::Accumulator;
use crate::client::{ChatTransport, HttpTransport, StreamRequest, UploadFile};
use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::conversation::{display_title, Attachment, Message, MessageList};
use crate::dispatcher::{self, Effect};
use crate::error::{ChatError, Result};
use crate::frame::{DecodedLine, FrameDecoder};
use crate::identity::{self, Binding};
use crate::interactive::{
    AuthState, AuthorizationFlow, ElicitationQueue, ElicitationRequest, PendingAuthorization,
};
use crate::protocol::{
    ChatInfoContent, ElicitationAction, ElicitationRespondRequest, Frame, InteractiveContent,
    StreamEvent,
};
use crate::reconstruction::reconstruct;
use crate::registry::{SessionRegistry, SessionView};
use crate::session::{ReaderHandle, Session, SessionKey};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// A stream request plus the attachments the stream task reads before sending it
struct Turn {
    request: StreamRequest,
    attachments: Vec<Attachment>,
}

/// A running stream. The conversation may be re-keyed while it runs.
pub struct StreamHandle {
    key: SessionKey,
    task: JoinHandle<SessionKey>,
}

impl StreamHandle {
    /// Key the stream started under
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Wait for the stream to end; returns the key the conversation ended up with
    pub async fn finished(self) -> Result<SessionKey> {
        self.task
            .await
            .map_err(|e| ChatError::Stream(format!("stream task failed: {}", e)))
    }
}

struct EngineInner {
    registry: SessionRegistry,
    transport: Arc<dyn ChatTransport>,
    collaborators: Arc<dyn Collaborators>,
    auth: Mutex<AuthorizationFlow>,
    elicitations: watch::Sender<ElicitationQueue>,
    /// Conversation currently on screen
    viewing: Mutex<Option<SessionKey>>,
    /// Ephemeral keys that have been bound, so callers holding the old key still reach the session
    redirects: Mutex<HashMap<SessionKey, SessionKey>>,
}

#[derive(Clone)]
pub struct ChatEngine {
    inner: Arc<EngineInner>,
}

impl ChatEngine {
    pub fn new(transport: Arc<dyn ChatTransport>, collaborators: Arc<dyn Collaborators>) -> Self {
        let (elicitations, _) = watch::channel(ElicitationQueue::new());
        Self {
            inner: Arc::new(EngineInner {
                registry: SessionRegistry::new(),
                transport,
                collaborators,
                auth: Mutex::new(AuthorizationFlow::new()),
                elicitations,
                viewing: Mutex::new(None),
                redirects: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn from_config(config: &EngineConfig, collaborators: Arc<dyn Collaborators>) -> Result<Self> {
        let transport = HttpTransport::from_config(config)?;
        info!(base_url = %config.api_base(), "chat engine ready");
        Ok(Self::new(Arc::new(transport), collaborators))
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Follow a migrated ephemeral key to the bound key
    pub fn resolve(&self, key: &SessionKey) -> SessionKey {
        self.inner.resolve(key)
    }

    pub fn session(&self, key: &SessionKey) -> Option<SessionView> {
        self.inner.registry.view(&self.resolve(key))
    }

    /// Switch the displayed conversation. Streams of other conversations keep running.
    pub fn view(&self, key: Option<SessionKey>) {
        let key = key.map(|k| self.resolve(&k));
        *lock(&self.inner.viewing) = key;
    }

    pub fn viewing(&self) -> Option<SessionKey> {
        lock(&self.inner.viewing).clone()
    }

    // ------------------------------------------------------------------------
    // Turns
    // ------------------------------------------------------------------------

    /// Send a user message. `None` starts a new conversation under an ephemeral key.
    pub async fn send(
        &self,
        target: Option<SessionKey>,
        text: impl Into<String>,
        files: Vec<Attachment>,
    ) -> Result<StreamHandle> {
        let text = text.into();
        let key = match target {
            Some(key) => self.resolve(&key),
            None => SessionKey::ephemeral(),
        };
        self.inner.registry.get_or_create(&key);

        let reader = ReaderHandle::new();
        let message = text.clone();
        let attachments = files.clone();
        self.begin_turn(&key, &reader, move |session| {
            let user_id = session.next_message_id();
            let assistant_id = session.next_message_id();
            session
                .messages
                .push(Message::user(user_id, message, attachments));
            session.messages.push(Message::assistant(assistant_id));
            Ok(())
        })?;
        self.view(Some(key.clone()));

        let request = StreamRequest::Send {
            chat_id: key.chat_id().map(str::to_string),
            message: text,
            files: Vec::new(),
        };
        Ok(self.spawn(
            key,
            Turn {
                request,
                attachments: files,
            },
            reader,
        ))
    }

    /// Regenerate the answer at `message_id`. A user message keeps its place and gets a new answer.
    pub async fn retry(&self, key: &SessionKey, message_id: &str) -> Result<StreamHandle> {
        let key = self.resolve(key);
        let chat_id = bound_id(&key)?;
        let reader = ReaderHandle::new();
        let retried = self.begin_turn(&key, &reader, |session| {
            let removed = session
                .messages
                .truncate_from(message_id)
                .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
            let retried = removed.id.clone();
            if removed.is_sent {
                let assistant_id = session.next_message_id();
                session.messages.push(removed);
                session.messages.push(Message::assistant(assistant_id));
            } else {
                session.messages.push(Message::assistant(removed.id));
            }
            Ok(retried)
        })?;

        let request = StreamRequest::Retry {
            chat_id,
            message_id: retried,
        };
        Ok(self.spawn(
            key,
            Turn {
                request,
                attachments: Vec::new(),
            },
            reader,
        ))
    }

    /// Replace the text of `message_id`, drop everything after it and ask again
    pub async fn edit(
        &self,
        key: &SessionKey,
        message_id: &str,
        text: impl Into<String>,
    ) -> Result<StreamHandle> {
        let text = text.into();
        let key = self.resolve(key);
        let chat_id = bound_id(&key)?;
        let reader = ReaderHandle::new();
        let edited = self.begin_turn(&key, &reader, |session| {
            let edited = session
                .messages
                .edit_and_truncate(message_id, &text)
                .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
            let assistant_id = session.next_message_id();
            session.messages.push(Message::assistant(assistant_id));
            Ok(edited)
        })?;

        let request = StreamRequest::Edit {
            chat_id,
            message_id: edited.id,
            content: text,
            files: Vec::new(),
        };
        Ok(self.spawn(
            key,
            Turn {
                request,
                attachments: edited.files,
            },
            reader,
        ))
    }

    /// Cancel the reader and tell the backend to stop
    pub async fn abort(&self, key: &SessionKey) -> Result<()> {
        let key = self.resolve(key);
        let session = self
            .inner
            .registry
            .get(&key)
            .ok_or_else(|| ChatError::SessionNotFound(key.to_string()))?;
        let reader = session.reader().cloned().ok_or(ChatError::NotStreaming)?;
        reader.cancel();
        info!(chat_id = %key, "stream aborted");

        if let Some(chat_id) = key.chat_id() {
            if let Err(e) = self.inner.transport.abort(chat_id).await {
                warn!(chat_id = %chat_id, error = %e, "backend abort failed");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------------

    /// Show a persisted conversation. Cached sessions, including ones still streaming, are not refetched.
    pub async fn load(&self, chat_id: &str) -> Result<Arc<Session>> {
        let key = SessionKey::bound(chat_id);
        self.view(Some(key.clone()));

        if let Some(session) = self.inner.registry.get(&key) {
            debug!(chat_id = %chat_id, "conversation served from cache");
            if let Some(title) = &session.title {
                self.inner.collaborators.set_title(&display_title(title));
            }
            return Ok(session);
        }

        let detail = self.inner.transport.load_chat(chat_id).await?;
        let rebuilt = reconstruct(&detail.messages);
        debug!(
            chat_id = %chat_id,
            messages = rebuilt.messages.len(),
            "conversation rebuilt"
        );
        let title = detail.chat.title;
        let session = self.inner.registry.insert_if_absent(Session::restored(
            key.clone(),
            title.clone(),
            rebuilt.messages,
            rebuilt.next_tool_key,
        ));
        if self.inner.is_viewing(&key) {
            self.inner.collaborators.set_title(&display_title(&title));
        }
        Ok(session)
    }

    /// Drop a conversation, stopping its stream first
    pub async fn delete(&self, key: &SessionKey) -> Result<()> {
        let key = self.resolve(key);
        let removed = self
            .inner
            .registry
            .remove(&key)
            .ok_or_else(|| ChatError::SessionNotFound(key.to_string()))?;

        if let Some(reader) = removed.reader() {
            reader.cancel();
            if let Some(chat_id) = key.chat_id() {
                if let Err(e) = self.inner.transport.abort(chat_id).await {
                    warn!(chat_id = %chat_id, error = %e, "backend abort failed");
                }
            }
        }
        {
            let mut viewing = lock(&self.inner.viewing);
            if viewing.as_ref() == Some(&key) {
                *viewing = None;
            }
        }
        lock(&self.inner.redirects).retain(|_, bound| bound != &key);
        info!(chat_id = %key, "conversation deleted");
        self.inner.collaborators.refresh_history().await;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Interactive
    // ------------------------------------------------------------------------

    pub fn authorization_state(&self) -> AuthState {
        lock(&self.inner.auth).state().clone()
    }

    /// User accepted the authorization prompt
    pub fn confirm_authorization(&self) -> Option<PendingAuthorization> {
        let pending = lock(&self.inner.auth).confirm()?;
        self.inner.collaborators.open_authorization(&pending);
        Some(pending)
    }

    /// User declined the authorization prompt. Callback failures are only logged.
    pub async fn cancel_authorization(&self) -> bool {
        let pending = lock(&self.inner.auth).cancel();
        let Some(pending) = pending else {
            return false;
        };
        if let Err(e) = self
            .inner
            .transport
            .cancel_authorization(&pending.state)
            .await
        {
            warn!(tool = %pending.tool_name, error = %e, "authorization cancel callback failed");
        }
        true
    }

    pub fn elicitations(&self) -> ElicitationQueue {
        self.inner.elicitations.borrow().clone()
    }

    pub fn subscribe_elicitations(&self) -> watch::Receiver<ElicitationQueue> {
        self.inner.elicitations.subscribe()
    }

    /// Answer one elicitation
    pub async fn respond_elicitation(
        &self,
        request_id: &str,
        action: ElicitationAction,
        content: Option<Value>,
    ) -> Result<()> {
        self.inner.elicitations.send_modify(|queue| {
            queue.remove(request_id);
        });
        let body = ElicitationRespondRequest {
            request_id: request_id.to_string(),
            action,
            content,
        };
        self.inner.transport.respond_elicitation(&body).await
    }

    /// Answer every queued elicitation with `action`. Returns how many were answered.
    pub async fn respond_all_elicitations(&self, action: ElicitationAction) -> usize {
        let mut snapshot = Vec::new();
        self.inner
            .elicitations
            .send_modify(|queue| snapshot = queue.drain_all());

        let total = snapshot.len();
        for request in snapshot {
            let body = ElicitationRespondRequest {
                request_id: request.request_id,
                action,
                content: None,
            };
            if let Err(e) = self.inner.transport.respond_elicitation(&body).await {
                warn!(request_id = %body.request_id, error = %e, "elicitation response failed");
            }
        }
        total
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Prepare a session for a new turn and register its reader, all in one update
    fn begin_turn<F, R>(&self, key: &SessionKey, reader: &ReaderHandle, prepare: F) -> Result<R>
    where
        F: FnOnce(&mut Session) -> Result<R>,
    {
        self.inner
            .registry
            .update_session(key, |session| {
                if session.streaming {
                    return Err(ChatError::AlreadyStreaming(key.to_string()));
                }
                if session.reader().is_some() {
                    return Err(ChatError::SessionBusy(key.to_string()));
                }
                let prepared = prepare(session)?;
                session.register_reader(reader.clone())?;
                session.streaming = true;
                session.accumulator = Some(Accumulator::new());
                Ok(prepared)
            })
            .ok_or_else(|| ChatError::SessionNotFound(key.to_string()))?
    }

    /// The task is spawned before any await so that `finish` covers every exit
    fn spawn(&self, key: SessionKey, turn: Turn, reader: ReaderHandle) -> StreamHandle {
        debug!(chat_id = %key, kind = turn.request.kind(), "starting stream");
        let inner = self.inner.clone();
        let task = tokio::spawn(inner.run_stream(key.clone(), turn, reader));
        StreamHandle { key, task }
    }
}

fn bound_id(key: &SessionKey) -> Result<String> {
    key.chat_id()
        .map(str::to_string)
        .ok_or_else(|| ChatError::SessionNotFound(key.to_string()))
}

impl EngineInner {
    fn resolve(&self, key: &SessionKey) -> SessionKey {
        lock(&self.redirects)
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.clone())
    }

    fn is_viewing(&self, key: &SessionKey) -> bool {
        lock(&self.viewing).as_ref() == Some(key)
    }

    async fn upload_files(&self, files: &[Attachment]) -> Vec<UploadFile> {
        let mut uploads = Vec::with_capacity(files.len());
        for file in files {
            match file {
                Attachment::Inline { name, data } => uploads.push(UploadFile {
                    name: name.clone(),
                    data: data.clone(),
                }),
                Attachment::Reference(reference) => {
                    match self.collaborators.read_file(reference).await {
                        Ok(data) => uploads.push(UploadFile {
                            name: file.name().to_string(),
                            data,
                        }),
                        Err(e) => {
                            warn!(file = %reference, error = %e, "skipping unreadable attachment")
                        }
                    }
                }
            }
        }
        uploads
    }

    /// Stream task body. Cleanup runs exactly once, whatever way the read loop ends.
    async fn run_stream(
        self: Arc<Self>,
        key: SessionKey,
        turn: Turn,
        reader: ReaderHandle,
    ) -> SessionKey {
        let mut key = key;
        let outcome = AssertUnwindSafe(self.pump(&mut key, turn, &reader))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(chat_id = %key, error = %e, "chat stream failed");
                self.fail_turn(&key, e.to_string());
            }
            Err(_) => {
                error!(chat_id = %key, "chat stream panicked");
                self.fail_turn(&key, "stream task panicked".to_string());
            }
        }
        self.finish(&key, &reader).await;
        key
    }

    async fn pump(
        &self,
        key: &mut SessionKey,
        turn: Turn,
        reader: &ReaderHandle,
    ) -> Result<()> {
        let Turn {
            mut request,
            attachments,
        } = turn;
        if !attachments.is_empty() {
            let uploads = tokio::select! {
                biased;
                _ = reader.cancelled() => {
                    debug!(chat_id = %key, "cancelled while reading attachments");
                    return Ok(());
                }
                uploads = self.upload_files(&attachments) => uploads,
            };
            request.attach(uploads);
        }

        let mut stream = tokio::select! {
            biased;
            _ = reader.cancelled() => {
                debug!(chat_id = %key, "cancelled before the stream opened");
                return Ok(());
            }
            opened = self.transport.open(request) => opened?,
        };

        let mut decoder = FrameDecoder::new();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = reader.cancelled() => {
                    debug!(chat_id = %key, "stream cancelled");
                    return Ok(());
                }
                next = stream.next() => match next {
                    Some(chunk) => chunk?,
                    None => break,
                },
            };
            for line in decoder.push(&chunk) {
                match line {
                    DecodedLine::Done => return Ok(()),
                    DecodedLine::Frame(payload) => {
                        if self.handle_frame(key, &payload).await == Flow::Stop {
                            return Ok(());
                        }
                    }
                }
            }
        }

        if decoder.pending() > 0 {
            debug!(chat_id = %key, bytes = decoder.pending(), "dropping incomplete trailing line");
        }
        Ok(())
    }

    async fn handle_frame(&self, key: &mut SessionKey, payload: &str) -> Flow {
        let frame = match Frame::parse(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(chat_id = %key, error = %e, "skipping malformed frame");
                return Flow::Continue;
            }
        };
        if !matches!(frame, Frame::Event(StreamEvent::Interactive(_))) {
            lock(&self.auth).observe_event();
        }

        let effects = self
            .registry
            .update_session(key, |session| dispatcher::dispatch(session, &frame));
        let Some(effects) = effects else {
            warn!(chat_id = %key, "session removed mid-stream");
            return Flow::Stop;
        };

        let mut flow = Flow::Continue;
        for effect in effects {
            match effect {
                Effect::ReloadTools => self.collaborators.reload_tools().await,
                Effect::ChatInfo(info) => self.bind(key, info).await,
                Effect::Interactive(content) => self.interactive(content).await,
                Effect::EndStream => flow = Flow::Stop,
            }
        }
        flow
    }

    async fn bind(&self, key: &mut SessionKey, info: ChatInfoContent) {
        let was_viewing = self.is_viewing(key);
        let mut migrated = false;
        match identity::bind(key, &info.id) {
            Binding::Migrate { from, to } => {
                // published before the move so the old key never dangles
                lock(&self.redirects).insert(from.clone(), to.clone());
                if self.registry.migrate(&from, &to) {
                    if was_viewing {
                        *lock(&self.viewing) = Some(to.clone());
                    }
                    info!(from = %from, to = %to, "conversation bound");
                    *key = to;
                    migrated = true;
                } else {
                    lock(&self.redirects).remove(&from);
                }
            }
            Binding::Unchanged => {}
            Binding::Conflict { bound, assigned } => {
                warn!(bound = %bound, assigned = %assigned, "ignoring chat id for an already bound conversation");
            }
        }

        if !info.title.is_empty() {
            let title = info.title.clone();
            self.registry
                .update_session(key, move |session| session.title = Some(title));
        }
        self.collaborators.refresh_history().await;
        if was_viewing {
            if !info.title.is_empty() {
                self.collaborators.set_title(&display_title(&info.title));
            }
            if migrated {
                self.collaborators.navigate(&info.id);
            }
        }
    }

    async fn interactive(&self, content: InteractiveContent) {
        match content {
            InteractiveContent::AuthenticationRequired(request) => {
                let started = lock(&self.auth).begin();
                if !started {
                    return;
                }
                self.collaborators.set_busy(true);
                self.collaborators.force_reload_tools().await;
                self.collaborators.set_busy(false);

                let pending = lock(&self.auth).reloaded(&request.server_name, &request.auth_url);
                if let Some(pending) = pending {
                    info!(tool = %pending.tool_name, "authorization required");
                    self.collaborators.prompt_authorization(&pending);
                }
            }
            InteractiveContent::ElicitationRequest(request) => {
                let request = ElicitationRequest::from(request);
                debug!(request_id = %request.request_id, "elicitation queued");
                self.collaborators.elicitation_requested(&request);
                self.elicitations.send_modify(|queue| queue.push(request));
            }
        }
    }

    /// Replace the placeholder answer with a terminal error message
    fn fail_turn(&self, key: &SessionKey, reason: String) {
        self.registry.update_session(key, move |session| {
            let placeholder = session
                .messages
                .last()
                .filter(|last| !last.is_sent)
                .map(|last| last.id.clone());
            let id = match placeholder {
                Some(id) => {
                    session.messages.pop();
                    id
                }
                None => session.next_message_id(),
            };
            session.messages.push(Message::error(id, reason));
        });
    }

    async fn finish(&self, key: &SessionKey, reader: &ReaderHandle) {
        self.registry.update_session(key, |session| {
            session.accumulator = None;
            session.release_reader(reader.id());
        });
        self.registry.set_streaming(key, false);
        self.collaborators.refresh_history().await;
        self.collaborators.refresh_usage().await;
        debug!(chat_id = %key, "stream finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_id_requires_bound_key() {
        assert_eq!(bound_id(&SessionKey::bound("abc")).unwrap(), "abc");
        assert!(matches!(
            bound_id(&SessionKey::Ephemeral("t".into())),
            Err(ChatError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_lock_recovers_from_poison() {
        let mutex = Arc::new(Mutex::new(1));
        let poisoner = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert_eq!(*lock(&mutex), 1);
    }
}
