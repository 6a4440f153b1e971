//! Seam to the upload pipeline for `upload.cancel` requests.

use async_trait::async_trait;

/// Forwards cancellation requests to whatever owns uploads.
#[async_trait]
pub trait UploadCanceller: Send + Sync + 'static {
    /// Cancel `upload_id` on behalf of `user_id`.
    ///
    /// The error string is reported to the client as `CANCELLATION_FAILED`.
    async fn cancel(&self, user_id: &str, upload_id: &str) -> Result<(), String>;
}

/// Canceller for deployments without an upload pipeline.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoUploadPipeline;

#[async_trait]
impl UploadCanceller for NoUploadPipeline {
    async fn cancel(&self, _user_id: &str, upload_id: &str) -> Result<(), String> {
        Err(format!("upload {upload_id} is not managed by this server"))
    }
}
