use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::multipart::{Form, Part};
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{ChatError, Result};
use crate::protocol::{ChatDetail, ChatDetailResponse, ElicitationRespondRequest, RetryRequest};

/// Raw response body of a streaming request
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// File payload uploaded with send/edit
#[derive(Debug, Clone, PartialEq)]
pub struct UploadFile {
    pub name: String,
    pub data: Bytes,
}

/// The three requests that answer with a chat stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRequest {
    Send {
        /// Absent for a conversation the backend has not assigned an id yet
        chat_id: Option<String>,
        message: String,
        files: Vec<UploadFile>,
    },
    Retry {
        chat_id: String,
        message_id: String,
    },
    Edit {
        chat_id: String,
        message_id: String,
        content: String,
        files: Vec<UploadFile>,
    },
}

impl StreamRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamRequest::Send { .. } => "send",
            StreamRequest::Retry { .. } => "retry",
            StreamRequest::Edit { .. } => "edit",
        }
    }

    /// Set the uploaded files. Retry carries none.
    pub fn attach(&mut self, uploads: Vec<UploadFile>) {
        match self {
            StreamRequest::Send { files, .. } | StreamRequest::Edit { files, .. } => {
                *files = uploads
            }
            StreamRequest::Retry { .. } => {}
        }
    }
}

/// Backend endpoints consumed by the engine
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Open a send/retry/edit request and return its body as a byte stream
    async fn open(&self, request: StreamRequest) -> Result<ByteStream>;

    /// Ask the backend to stop server-side work for `chat_id`
    async fn abort(&self, chat_id: &str) -> Result<()>;

    async fn respond_elicitation(&self, body: &ElicitationRespondRequest) -> Result<()>;

    /// Authorization callback with an empty code, telling the backend the user declined
    async fn cancel_authorization(&self, state: &str) -> Result<()>;

    /// Persisted rows of a conversation
    async fn load_chat(&self, chat_id: &str) -> Result<ChatDetail>;
}

/// HTTP client for the chat backend
pub struct HttpTransport {
    base_url: String,
    http_client: reqwest::Client,
    /// Applied to non-streaming calls only
    request_timeout: Option<Duration>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, http_client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
            request_timeout: None,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder().build()?;
        let transport = Self::new(config.api_base(), http_client);
        Ok(match config.request_timeout_secs {
            Some(secs) => transport.with_timeout(Duration::from_secs(secs)),
            None => transport,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_timeout_applied(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.request_timeout {
            Some(timeout) => builder.timeout(timeout),
            None => builder,
        }
    }

    fn files_form(mut form: Form, files: Vec<UploadFile>) -> Form {
        for file in files {
            let part = Part::bytes(file.data.to_vec()).file_name(file.name);
            form = form.part("files", part);
        }
        form
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(ChatError::Status { status, body })
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open(&self, request: StreamRequest) -> Result<ByteStream> {
        debug!(kind = request.kind(), "opening chat stream");
        let builder = match request {
            StreamRequest::Send {
                chat_id,
                message,
                files,
            } => {
                let mut form = Form::new().text("message", message);
                if let Some(chat_id) = chat_id {
                    form = form.text("chatId", chat_id);
                }
                self.http_client
                    .post(self.url("/chat"))
                    .multipart(Self::files_form(form, files))
            }
            StreamRequest::Retry {
                chat_id,
                message_id,
            } => self.http_client.post(self.url("/chat/retry")).json(&RetryRequest {
                chat_id,
                message_id,
            }),
            StreamRequest::Edit {
                chat_id,
                message_id,
                content,
                files,
            } => {
                let form = Form::new()
                    .text("chatId", chat_id)
                    .text("messageId", message_id)
                    .text("content", content);
                self.http_client
                    .post(self.url("/chat/edit"))
                    .multipart(Self::files_form(form, files))
            }
        };

        let response = Self::check(builder.send().await?).await?;
        Ok(response.bytes_stream().map_err(ChatError::from).boxed())
    }

    async fn abort(&self, chat_id: &str) -> Result<()> {
        let builder = self
            .http_client
            .post(self.url(&format!("/chat/{}/abort", chat_id)));
        Self::check(self.with_timeout_applied(builder).send().await?).await?;
        Ok(())
    }

    async fn respond_elicitation(&self, body: &ElicitationRespondRequest) -> Result<()> {
        let builder = self
            .http_client
            .post(self.url("/tools/elicitation/respond"))
            .json(body);
        Self::check(self.with_timeout_applied(builder).send().await?).await?;
        Ok(())
    }

    async fn cancel_authorization(&self, state: &str) -> Result<()> {
        let builder = self
            .http_client
            .get(self.url("/tools/login/oauth/callback"))
            .query(&[("code", ""), ("state", state)]);
        Self::check(self.with_timeout_applied(builder).send().await?).await?;
        Ok(())
    }

    async fn load_chat(&self, chat_id: &str) -> Result<ChatDetail> {
        let builder = self.http_client.get(self.url(&format!("/chat/{}", chat_id)));
        let response = Self::check(self.with_timeout_applied(builder).send().await?).await?;
        let body: ChatDetailResponse = response.json().await?;
        match body.data {
            Some(detail) if body.success => Ok(detail),
            _ => Err(ChatError::SessionNotFound(
                body.message.unwrap_or_else(|| chat_id.to_string()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_prefix_without_double_slash() {
        let transport = HttpTransport::new("http://localhost:61990/api/", reqwest::Client::new());
        assert_eq!(transport.url("/chat/retry"), "http://localhost:61990/api/chat/retry");
    }

    #[test]
    fn test_from_config_uses_timeout_for_control_calls() {
        let config = EngineConfig {
            request_timeout_secs: Some(5),
            ..EngineConfig::default()
        };
        let transport = HttpTransport::from_config(&config).unwrap();
        assert_eq!(transport.request_timeout, Some(Duration::from_secs(5)));
        assert!(transport.base_url.ends_with("/api"));
    }

    #[test]
    fn test_stream_request_kind() {
        let request = StreamRequest::Retry {
            chat_id: "abc".into(),
            message_id: "m1".into(),
        };
        assert_eq!(request.kind(), "retry");
    }

    #[test]
    fn test_attach_fills_send_and_ignores_retry() {
        let upload = UploadFile {
            name: "a.txt".into(),
            data: Bytes::from_static(b"hi"),
        };
        let mut send = StreamRequest::Send {
            chat_id: None,
            message: "m".into(),
            files: Vec::new(),
        };
        send.attach(vec![upload.clone()]);
        assert!(matches!(&send, StreamRequest::Send { files, .. } if files == &vec![upload.clone()]));

        let mut retry = StreamRequest::Retry {
            chat_id: "abc".into(),
            message_id: "m1".into(),
        };
        retry.attach(vec![upload]);
        assert_eq!(retry.kind(), "retry");
    }
}
