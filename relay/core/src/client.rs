//! Chat Client
//!
//! The requester-side orchestrator. One generic client drives every model;
//! model differences live in the [`ModelProfile`] it is built with.
//!
//! # Completion Flow
//!
//! ```text
//! completion(prompt)
//!   ├─ session probe ........ UNAUTHORIZED -> LoginFlow::begin, Error
//!   ├─ permission check ..... MODEL_NO_PERMISSION
//!   ├─ create ............... reuse or open the conversation socket
//!   ├─ register request ..... before the prompt goes out
//!   ├─ chat ................. ack -> Generating, timer starts
//!   └─ stream ............... Generating* -> Done | Error
//! ```
//!
//! Failures at any step surface as the completion's single `Error` response.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::auth::{LoginFlow, UserInfo};
use crate::bridge::Bridge;
use crate::error::{ChatError, ErrorCode};
use crate::messages::{BridgeReply, BridgeRequest, ConversationId, RequestId};
use crate::models::ModelProfile;
use crate::streaming::{
    ConversationResponse, RequestTable, ResponseKind, StreamListener, StreamSession,
    DEFAULT_REQUEST_TIMEOUT,
};

struct ClientInner {
    bridge: Arc<dyn Bridge>,
    listener: StreamListener,
    profile: ModelProfile,
    login: Arc<dyn LoginFlow>,
    request_timeout: Duration,
    check_session: bool,
}

/// Requester-side completion orchestrator
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<ClientInner>,
}

impl ChatClient {
    /// Build the requester context for `profile`
    ///
    /// Subscribes to the bridge's broadcasts; must be called inside a tokio
    /// runtime.
    #[must_use]
    pub fn init(bridge: Arc<dyn Bridge>, profile: ModelProfile, login: Arc<dyn LoginFlow>) -> Self {
        let listener = StreamListener::init(bridge.as_ref(), RequestTable::new());
        tracing::info!(model = %profile.name, "Chat client initialized");
        Self {
            inner: Arc::new(ClientInner {
                bridge,
                listener,
                profile,
                login,
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
                check_session: true,
            }),
        }
    }

    /// Override the request timeout
    ///
    /// Only takes effect before the client is cloned.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.request_timeout = timeout;
        }
        self
    }

    /// Skip the session probe before each completion
    ///
    /// Only takes effect before the client is cloned.
    #[must_use]
    pub fn without_session_check(mut self) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.check_session = false;
        }
        self
    }

    /// Model this client drives
    #[must_use]
    pub fn profile(&self) -> &ModelProfile {
        &self.inner.profile
    }

    /// Requests currently waiting for frames
    #[must_use]
    pub fn table(&self) -> &RequestTable {
        self.inner.listener.table()
    }

    /// Start a fresh conversation id
    #[must_use]
    pub fn new_conversation(&self) -> ConversationId {
        ConversationId::new()
    }

    /// Probe the background's stored login
    ///
    /// # Errors
    ///
    /// `UNAUTHORIZED` (after starting the login flow) or the probe's failure.
    pub async fn check_login(&self) -> Result<UserInfo, ChatError> {
        match self.inner.bridge.request(BridgeRequest::Session).await {
            Ok(BridgeReply::Session(user)) => Ok(user),
            Ok(other) => Err(unexpected("session", &other)),
            Err(e) => Err(self.inner.surface(e).await),
        }
    }

    /// Complete `prompt` in a new conversation
    pub fn completion(&self, prompt: impl Into<String>) -> Completion {
        self.completion_in(self.new_conversation(), prompt)
    }

    /// Complete `prompt` in an existing conversation
    pub fn completion_in(&self, conversation_id: ConversationId, prompt: impl Into<String>) -> Completion {
        let request_id = RequestId::new();
        let (out, responses) = mpsc::unbounded_channel();
        let session = StreamSession::new(conversation_id.clone(), request_id.clone());

        tracing::info!(
            conversation_id = %conversation_id,
            request_id = %request_id,
            model = %self.inner.profile.name,
            "Completion started"
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(inner.run(session, prompt.into(), out));

        Completion {
            conversation_id,
            request_id,
            responses,
        }
    }

    /// Stop listening and fail every waiting request
    pub fn reset(&self) {
        self.inner.listener.reset();
        tracing::info!("Chat client reset");
    }
}

impl ClientInner {
    async fn run(
        self: Arc<Self>,
        mut session: StreamSession,
        prompt: String,
        out: mpsc::UnboundedSender<ConversationResponse>,
    ) {
        session.begin();
        let conversation_id = session.conversation_id().clone();
        let request_id = session.request_id().clone();

        if let Err(error) = self.prepare(&conversation_id).await {
            emit(&out, session.fail(error));
            return;
        }

        let table = self.listener.table().clone();
        let frames = table.register(&conversation_id, request_id.clone());

        let chat = BridgeRequest::Chat {
            conversation_id: conversation_id.clone(),
            prompt,
            role_id: self.profile.role_id,
            model_id: self.profile.model_id,
        };
        let failure = match self.bridge.request(chat).await {
            Ok(BridgeReply::Ack { .. }) => None,
            Ok(other) => Some(unexpected("chat", &other)),
            Err(e) => Some(self.surface(e).await),
        };
        if let Some(error) = failure {
            table.deregister(&conversation_id, &request_id);
            tracing::error!(conversation_id = %conversation_id, error = %error, "Chat request failed");
            emit(&out, session.fail(error));
            return;
        }

        emit(&out, session.connected());
        session.drive(frames, table, self.request_timeout, out).await;
    }

    /// Session probe, permission check, and create
    async fn prepare(&self, conversation_id: &ConversationId) -> Result<(), ChatError> {
        if self.check_session {
            let user = match self.bridge.request(BridgeRequest::Session).await {
                Ok(BridgeReply::Session(user)) => user,
                Ok(other) => return Err(unexpected("session", &other)),
                Err(e) => return Err(self.surface(e).await),
            };
            if !self.profile.can_use(&user) {
                tracing::warn!(model = %self.profile.name, user = %user.username, "Model not permitted");
                return Err(ChatError::model_no_permission());
            }
        }

        let create = BridgeRequest::Create {
            conversation_id: Some(conversation_id.clone()),
            role_id: self.profile.role_id,
            model_id: self.profile.model_id,
        };
        match self.bridge.request(create).await {
            Ok(BridgeReply::Created { conversation_id: created }) if &created == conversation_id => Ok(()),
            Ok(other) => Err(unexpected("create", &other)),
            Err(e) => Err(self.surface(e).await),
        }
    }

    /// Start the login flow on `UNAUTHORIZED`, then hand the error back
    async fn surface(&self, error: ChatError) -> ChatError {
        if error.is_unauthorized() {
            self.login.begin().await;
        }
        error
    }
}

fn unexpected(request: &str, reply: &BridgeReply) -> ChatError {
    ChatError::with_message(
        ErrorCode::UnknownError,
        format!("unexpected reply to {request}: {reply:?}"),
    )
}

fn emit(out: &mpsc::UnboundedSender<ConversationResponse>, response: Option<ConversationResponse>) {
    if let Some(response) = response {
        let _ = out.send(response);
    }
}

// ============================================================================
// Completion Handle
// ============================================================================

/// Responses of one completion request
#[derive(Debug)]
pub struct Completion {
    conversation_id: ConversationId,
    request_id: RequestId,
    responses: mpsc::UnboundedReceiver<ConversationResponse>,
}

impl Completion {
    /// Conversation the prompt was sent in
    #[must_use]
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Id of this request
    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Next response; `None` after the terminal one
    pub async fn next(&mut self) -> Option<ConversationResponse> {
        self.responses.recv().await
    }

    /// Wait for the terminal response
    ///
    /// # Errors
    ///
    /// The completion's error descriptor.
    pub async fn finish(mut self) -> Result<String, ChatError> {
        while let Some(response) = self.responses.recv().await {
            match response.kind {
                ResponseKind::Generating { .. } => {}
                ResponseKind::Done { text } => return Ok(text),
                ResponseKind::Error { error } => return Err(error),
            }
        }
        Err(ChatError::with_message(
            ErrorCode::UnknownError,
            "completion ended without a result",
        ))
    }

    /// Responses as a `Stream`
    #[must_use]
    pub fn into_stream(self) -> UnboundedReceiverStream<ConversationResponse> {
        UnboundedReceiverStream::new(self.responses)
    }
}
