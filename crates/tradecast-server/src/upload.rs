//! Forwards chart uploads to the analysis worker as multipart requests.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

pub const UPLOAD_SUCCESS_MESSAGE: &str = "File uploaded successfully";

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Content-Type must be multipart/form-data")]
    NotMultipart,
    #[error("No file uploaded")]
    MissingFile,
    #[error("invalid multipart body: {0}")]
    Multipart(String),
    #[error("Failed to upload file to webhook (status {status})")]
    Upstream { status: u16 },
    #[error("worker unreachable: {0}")]
    Transport(String),
    #[error("invalid worker response: {0}")]
    InvalidResponse(String),
}

impl UploadError {
    /// Whether the caller sent a bad request, as opposed to a worker failure.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::NotMultipart | Self::MissingFile | Self::Multipart(_))
    }
}

/// One file taken from the inbound form.
#[derive(Clone, Debug)]
pub struct UploadedFile {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub message: String,
    pub file_id: Option<String>,
    pub file_name: Option<String>,
    pub status: String,
}

/// Body the worker answers with.
#[derive(Debug, Deserialize)]
struct WorkerUpload {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    name: Option<String>,
}

/// Reject requests whose content type is not `multipart/form-data`.
pub fn require_multipart(content_type: Option<&str>) -> Result<(), UploadError> {
    match content_type {
        Some(ct) if ct.trim_start().to_ascii_lowercase().starts_with("multipart/form-data") => {
            Ok(())
        }
        _ => Err(UploadError::NotMultipart),
    }
}

#[derive(Clone)]
pub struct UploadForwarder {
    client: reqwest::Client,
    url: String,
}

impl UploadForwarder {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UploadError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn forward(&self, file: UploadedFile) -> Result<UploadReceipt, UploadError> {
        let size = file.bytes.len();
        let mut part = reqwest::multipart::Part::bytes(file.bytes.to_vec())
            .file_name(file.file_name.clone());
        if let Some(ct) = file.content_type.as_deref() {
            part = part
                .mime_str(ct)
                .map_err(|e| UploadError::Multipart(e.to_string()))?;
        }
        let form = reqwest::multipart::Form::new().part("file", part);

        let resp = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            warn!(url = %self.url, status, "worker rejected upload");
            return Err(UploadError::Upstream { status });
        }

        let uploaded: WorkerUpload = resp
            .json()
            .await
            .map_err(|e| UploadError::InvalidResponse(e.to_string()))?;

        info!(file_name = %file.file_name, bytes = size, "upload forwarded to worker");
        Ok(UploadReceipt {
            message: UPLOAD_SUCCESS_MESSAGE.to_string(),
            file_id: uploaded.id.map(|id| match id {
                Value::String(s) => s,
                other => other.to_string(),
            }),
            file_name: uploaded.name,
            status: "success".to_string(),
        })
    }
}
