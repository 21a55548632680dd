//! Response sink backed by an axum streaming body.
//!
//! Writes are buffered until the pipeline flushes. The first flush commits
//! the status line and headers through a oneshot, which lets the handler
//! build its `Response`; every flush then pushes the buffered bytes as one
//! body chunk over an unbounded channel. When axum drops the body because
//! the client went away, the channel closes and the sink reports a
//! disconnect.

use std::convert::Infallible;

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use trickle_render::{BoxFuture, ResponseSink, SinkError};

/// Status line and headers, committed on first flush.
#[derive(Debug, Clone)]
pub struct Head {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

pub struct ChannelSink {
    status: u16,
    headers: Vec<(String, String)>,
    head_tx: Option<oneshot::Sender<Head>>,
    body_tx: Option<mpsc::UnboundedSender<Bytes>>,
    buffer: Vec<u8>,
    bytes_written: u64,
}

/// The handler's end of a [`ChannelSink`].
pub struct ResponseHandle {
    head: oneshot::Receiver<Head>,
    body: mpsc::UnboundedReceiver<Bytes>,
}

pub fn channel() -> (ChannelSink, ResponseHandle) {
    let (head_tx, head) = oneshot::channel();
    let (body_tx, body) = mpsc::unbounded_channel();
    let sink = ChannelSink {
        status: 200,
        headers: Vec::new(),
        head_tx: Some(head_tx),
        body_tx: Some(body_tx),
        buffer: Vec::new(),
        bytes_written: 0,
    };
    (sink, ResponseHandle { head, body })
}

impl ChannelSink {
    fn commit(&mut self) -> Result<(), SinkError> {
        let Some(head_tx) = self.head_tx.take() else {
            return Ok(());
        };
        let head = Head {
            status: self.status,
            headers: std::mem::take(&mut self.headers),
        };
        head_tx.send(head).map_err(|_| SinkError::Disconnected)
    }
}

impl ResponseSink for ChannelSink {
    fn set_status(&mut self, status: u16) -> bool {
        if self.head_tx.is_none() {
            return false;
        }
        self.status = status;
        true
    }

    fn set_header(&mut self, name: &str, value: &str) -> bool {
        if self.head_tx.is_none() {
            return false;
        }
        self.headers.push((name.to_string(), value.to_string()));
        true
    }

    fn headers_sent(&self) -> bool {
        self.head_tx.is_none()
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        if self.body_tx.is_none() {
            return Err(SinkError::Disconnected);
        }
        self.buffer.extend_from_slice(chunk);
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.commit()?;
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::take(&mut self.buffer));
        let Some(body_tx) = &self.body_tx else {
            return Err(SinkError::Disconnected);
        };
        body_tx.send(chunk).map_err(|_| SinkError::Disconnected)
    }

    fn reset(&mut self) {
        self.bytes_written -= self.buffer.len() as u64;
        self.buffer.clear();
    }

    fn close(&mut self) {
        if let Err(e) = self.flush() {
            debug!(error = %e, "final flush failed");
        }
        self.body_tx = None;
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn disconnected(&self) -> BoxFuture<()> {
        match self.body_tx.clone() {
            Some(body_tx) => Box::pin(async move { body_tx.closed().await }),
            None => Box::pin(std::future::ready(())),
        }
    }
}

impl ResponseHandle {
    /// Wait for the head to be committed and build a streaming response.
    pub async fn into_response(self) -> Response {
        let Ok(head) = self.head.await else {
            warn!("render task ended before committing a response");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        };

        let stream = futures_util::stream::unfold(self.body, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
        });
        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() =
            StatusCode::from_u16(head.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let headers = response.headers_mut();
        for (name, value) in head.headers {
            // The server frames streamed bodies itself.
            if name.eq_ignore_ascii_case("transfer-encoding") {
                continue;
            }
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => warn!(header = %name, "dropping invalid response header"),
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn head_commits_on_first_flush() {
        let (mut sink, handle) = channel();
        sink.set_status(201);
        sink.set_header("Content-Type", "text/html");
        sink.set_header("Transfer-Encoding", "chunked");
        sink.write(b"<p>").unwrap();
        assert!(!sink.headers_sent());

        sink.flush().unwrap();
        assert!(sink.headers_sent());
        assert!(!sink.set_status(500));

        sink.write(b"hi</p>").unwrap();
        sink.close();

        let response = handle.into_response().await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["content-type"], "text/html");
        assert!(response.headers().get("transfer-encoding").is_none());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"<p>hi</p>");
    }

    #[tokio::test]
    async fn reset_discards_unflushed_output() {
        let (mut sink, handle) = channel();
        sink.write(b"partial head").unwrap();
        sink.reset();
        sink.set_status(500);
        sink.close();
        assert_eq!(sink.bytes_written(), 0);

        let response = handle.into_response().await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn dropped_receiver_reports_disconnect() {
        let (mut sink, handle) = channel();
        drop(handle);
        sink.write(b"x").unwrap();
        assert_eq!(sink.flush(), Err(SinkError::Disconnected));
    }

    #[tokio::test]
    async fn dropped_body_resolves_disconnected() {
        let (mut sink, handle) = channel();
        sink.write(b"<p>").unwrap();
        sink.flush().unwrap();
        let gone = sink.disconnected();

        let response = handle.into_response().await;
        drop(response);
        gone.await;
        assert_eq!(sink.flush(), Ok(()));
        sink.write(b"x").unwrap();
        assert_eq!(sink.flush(), Err(SinkError::Disconnected));
    }

    #[tokio::test]
    async fn uncommitted_sink_yields_500() {
        let (sink, handle) = channel();
        drop(sink);
        let response = handle.into_response().await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
