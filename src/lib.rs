//! Streaming chat session engine.
//!
//! Opens chat requests against the agent backend, decodes the framed event
//! stream and folds it into per-conversation message lists, including tool
//! calls and results rendered as inline tagged blocks. Conversations can stream
//! concurrently, move from a temporary key to their server id mid-stream, and
//! raise interactive authorization and elicitation requests.

pub mod accumulator;
pub mod client;
pub mod collaborators;
pub mod config;
pub mod conversation;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod frame;
pub mod identity;
pub mod interactive;
pub mod protocol;
pub mod reconstruction;
pub mod registry;
pub mod session;
pub mod tool_block;

pub use client::{ByteStream, ChatTransport, HttpTransport, StreamRequest, UploadFile};
pub use collaborators::{Collaborators, NoopCollaborators};
pub use config::EngineConfig;
pub use conversation::{Attachment, Message, ResourceUsage};
pub use engine::{ChatEngine, StreamHandle};
pub use error::{ChatError, Result};
pub use interactive::{AuthState, ElicitationRequest, PendingAuthorization};
pub use protocol::ElicitationAction;
pub use registry::{SessionRegistry, SessionView};
pub use session::{Session, SessionKey};
