use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

use tradecast_core::codec::encode_comment;
use tradecast_core::{Frame, StreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    #[error("sink already closed")]
    Closed,
    #[error("client disconnected")]
    Disconnected,
}

impl From<WriteError> for StreamError {
    fn from(err: WriteError) -> Self {
        StreamError::Write(err.to_string())
    }
}

/// Write half of a relay response. Once closed, every further write is
/// rejected and `close` is a no-op.
#[derive(Debug)]
pub struct FrameSink {
    tx: Option<mpsc::Sender<Bytes>>,
    closed: bool,
    frames_written: u64,
}

impl FrameSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            tx: Some(tx),
            closed: false,
            frames_written: 0,
        };
        (sink, rx)
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), WriteError> {
        self.enqueue(frame.to_bytes()).await?;
        self.frames_written += 1;
        Ok(())
    }

    pub async fn comment(&mut self, text: &str) -> Result<(), WriteError> {
        self.enqueue(Bytes::from(encode_comment(text))).await
    }

    async fn enqueue(&mut self, bytes: Bytes) -> Result<(), WriteError> {
        if self.closed {
            return Err(WriteError::Closed);
        }
        let Some(tx) = self.tx.as_ref() else {
            return Err(WriteError::Closed);
        };
        if tx.send(bytes).await.is_err() {
            // receiver gone: the response body was dropped
            self.closed = true;
            self.tx = None;
            return Err(WriteError::Disconnected);
        }
        Ok(())
    }

    /// End the response. Returns true only for the call that actually closed it.
    pub fn close(&mut self) -> bool {
        if self.closed && self.tx.is_none() {
            return false;
        }
        self.closed = true;
        self.tx = None;
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Event frames written so far. Comments are not counted.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

/// Streaming response body. Dropping it cancels the owning relay.
pub struct RelayBody {
    rx: mpsc::Receiver<Bytes>,
    _guard: DropGuard,
}

impl RelayBody {
    pub fn new(rx: mpsc::Receiver<Bytes>, guard: DropGuard) -> Self {
        Self { rx, _guard: guard }
    }
}

impl Stream for RelayBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[tokio::test]
    async fn writes_encoded_frames() {
        let (mut sink, mut rx) = FrameSink::channel(4);
        sink.send(&Frame::data("{}")).await.unwrap();
        sink.comment("keep-alive").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from("event: data\ndata: {}\n\n"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from(": keep-alive\n\n"));
        assert_eq!(sink.frames_written(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_writes() {
        let (mut sink, mut rx) = FrameSink::channel(4);
        assert!(sink.close());
        assert!(!sink.close());
        assert!(sink.is_closed());
        assert_eq!(sink.send(&Frame::no_data()).await, Err(WriteError::Closed));
        // the receiver sees end of stream
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_receiver_reports_disconnect_once() {
        let (mut sink, rx) = FrameSink::channel(4);
        drop(rx);
        assert_eq!(sink.send(&Frame::data("x")).await, Err(WriteError::Disconnected));
        assert_eq!(sink.send(&Frame::data("x")).await, Err(WriteError::Closed));
        assert!(!sink.close());

        let err = StreamError::from(WriteError::Disconnected);
        assert_eq!(err.error_kind(), "write");
        assert_eq!(err.to_string(), "write failed: client disconnected");
    }

    #[tokio::test]
    async fn dropping_body_cancels_token() {
        let (mut sink, rx) = FrameSink::channel(4);
        let token = CancellationToken::new();
        let mut body = RelayBody::new(rx, token.clone().drop_guard());

        sink.send(&Frame::data("1")).await.unwrap();
        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from("event: data\ndata: 1\n\n"));
        assert!(!token.is_cancelled());

        drop(body);
        assert!(token.is_cancelled());
    }
}
