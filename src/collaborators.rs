use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::interactive::{ElicitationRequest, PendingAuthorization};

/// Outside services the engine notifies or queries.
///
/// Every hook defaults to a no-op, so an embedder only implements what it shows.
#[async_trait]
pub trait Collaborators: Send + Sync {
    /// A tool server was added mid-turn
    async fn reload_tools(&self) {}

    /// Blocking reload of the tool registry ahead of an authorization prompt
    async fn force_reload_tools(&self) {}

    async fn refresh_history(&self) {}

    async fn refresh_usage(&self) {}

    /// Redirect the view to a newly bound conversation id
    fn navigate(&self, _chat_id: &str) {}

    fn set_title(&self, _title: &str) {}

    /// Global busy indicator
    fn set_busy(&self, _busy: bool) {}

    fn prompt_authorization(&self, _pending: &PendingAuthorization) {}

    /// Open the external authorization surface after the user confirmed
    fn open_authorization(&self, _pending: &PendingAuthorization) {}

    fn elicitation_requested(&self, _request: &ElicitationRequest) {}

    /// Resolve a local path or URL reference to bytes before upload
    async fn read_file(&self, reference: &str) -> Result<Bytes> {
        let data = tokio::fs::read(reference).await?;
        Ok(Bytes::from(data))
    }
}

/// Collaborators that ignore every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCollaborators;

#[async_trait]
impl Collaborators for NoopCollaborators {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_read_file_reads_local_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, b"hello").unwrap();
        let data = NoopCollaborators
            .read_file(path.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(&data[..], b"hello");
    }

    #[tokio::test]
    async fn test_default_read_file_missing_is_io_error() {
        let err = NoopCollaborators
            .read_file("/definitely/not/here.bin")
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::ChatError::Io(_)));
    }
}
