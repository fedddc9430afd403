use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tracing::debug;

use tradecast_core::StreamError;

use crate::error::ClientError;

/// Raw response body chunks, in network order.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

/// Opens one physical event stream.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        headers: &[(String, String)],
        last_event_id: Option<&str>,
    ) -> Result<ByteStream, StreamError>;
}

/// Connector backed by a shared `reqwest::Client`.
#[derive(Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new() -> Result<Self, ClientError> {
        // No overall timeout: the response body is open-ended.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self::with_client(client))
    }

    /// Reuse an existing client, e.g. one with custom TLS or proxy settings.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        url: &str,
        headers: &[(String, String)],
        last_event_id: Option<&str>,
    ) -> Result<ByteStream, StreamError> {
        let mut req = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        for (name, value) in headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(id) = last_event_id {
            req = req.header("Last-Event-ID", id);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(StreamError::from_status(status, body));
        }
        debug!(url, status = resp.status().as_u16(), "event stream opened");

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| StreamError::Transport(e.to_string())));
        Ok(Box::pin(stream))
    }
}
