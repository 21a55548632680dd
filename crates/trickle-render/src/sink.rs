//! Output sink abstraction and the closed-state write guard.
//!
//! The pipeline never touches a transport directly. It is handed some
//! [`ResponseSink`] (a chunked HTTP body, an in-memory buffer, ...) and
//! wraps it in a [`GuardedSink`], which owns the open/closed state for
//! the lifetime of one response. Writes issued after the sink closed are
//! logged and dropped instead of surfacing as errors.

use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::page::BoxFuture;

/// Failure reported by a transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("client disconnected")]
    Disconnected,
}

/// A writable, flushable, closable byte sink with HTTP-style status and
/// headers.
///
/// Status and headers may be changed until the first flush commits them;
/// after that [`set_status`](ResponseSink::set_status) returns `false`.
pub trait ResponseSink: Send {
    fn set_status(&mut self, status: u16) -> bool;
    fn set_header(&mut self, name: &str, value: &str) -> bool;
    fn headers_sent(&self) -> bool;
    fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError>;
    fn flush(&mut self) -> Result<(), SinkError>;
    /// Discard body bytes that have not been flushed yet.
    fn reset(&mut self);
    fn close(&mut self);
    fn bytes_written(&self) -> u64;

    /// Resolves once the client has gone away. Transports that cannot
    /// observe this never resolve.
    fn disconnected(&self) -> BoxFuture<()> {
        Box::pin(std::future::pending())
    }
}

/// Exclusive owner of a response's sink.
pub struct GuardedSink<S> {
    inner: S,
    closed: bool,
    dropped_writes: u64,
}

impl<S: ResponseSink> GuardedSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            closed: false,
            dropped_writes: 0,
        }
    }

    pub fn write(&mut self, chunk: impl AsRef<[u8]>) {
        let chunk = chunk.as_ref();
        if self.closed {
            self.dropped_writes += 1;
            error!(
                bytes = chunk.len(),
                dropped_writes = self.dropped_writes,
                "attempted write after response finished"
            );
            return;
        }
        if let Err(e) = self.inner.write(chunk) {
            self.disconnect(e);
        }
    }

    /// Push buffered output to the client. Returns `true` if a flush was
    /// actually issued.
    pub fn flush(&mut self) -> bool {
        if self.closed {
            debug!("flush after response finished ignored");
            return false;
        }
        match self.inner.flush() {
            Ok(()) => true,
            Err(e) => {
                self.disconnect(e);
                false
            }
        }
    }

    pub fn set_status(&mut self, status: u16) -> bool {
        if self.closed || !self.inner.set_status(status) {
            warn!(status, "status change ignored, headers already sent");
            return false;
        }
        true
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> bool {
        if self.closed || !self.inner.set_header(name, value) {
            warn!(header = name, "header ignored, headers already sent");
            return false;
        }
        true
    }

    pub fn headers_sent(&self) -> bool {
        self.inner.headers_sent()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Resolves once no more output can reach the client: immediately if
    /// the sink is already closed, otherwise when the transport reports a
    /// disconnect. Does not borrow the sink.
    pub fn disconnected(&self) -> BoxFuture<()> {
        if self.closed {
            return Box::pin(std::future::ready(()));
        }
        self.inner.disconnected()
    }

    /// Record a disconnect observed outside of a write or flush.
    pub fn mark_disconnected(&mut self) {
        if !self.closed {
            self.disconnect(SinkError::Disconnected);
        }
    }

    pub fn close(&mut self) {
        if self.closed {
            debug!("sink already closed");
            return;
        }
        self.inner.close();
        self.closed = true;
    }

    /// Terminate the response after a failure: if nothing has been
    /// committed yet, drop buffered output and send `status` instead.
    pub fn fail(&mut self, status: u16) {
        if !self.closed && !self.inner.headers_sent() {
            self.inner.reset();
            self.inner.set_status(status);
        }
        self.close();
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.bytes_written()
    }

    pub fn dropped_writes(&self) -> u64 {
        self.dropped_writes
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn disconnect(&mut self, e: SinkError) {
        warn!(error = %e, "sink rejected output, closing");
        self.inner.close();
        self.closed = true;
    }
}

/// One observable operation on a [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Write { text: String, at_ms: u64 },
    Flush { at_ms: u64 },
    Close { at_ms: u64 },
}

#[derive(Debug)]
struct MemoryState {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    committed: usize,
    headers_sent: bool,
    closed: bool,
    events: Vec<SinkEvent>,
    created: Instant,
}

/// Sink that keeps the whole response in memory.
///
/// Clones share the same buffer, so one clone can be handed to a
/// pipeline while another inspects the result.
#[derive(Debug, Clone)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
    gone: Arc<watch::Sender<bool>>,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                status: 200,
                headers: Vec::new(),
                body: Vec::new(),
                committed: 0,
                headers_sent: false,
                closed: false,
                events: Vec::new(),
                created: Instant::now(),
            })),
            gone: Arc::new(watch::Sender::new(false)),
        }
    }

    /// Simulate the client going away: later writes and flushes fail and
    /// [`ResponseSink::disconnected`] resolves.
    pub fn disconnect(&self) {
        self.lock().closed = true;
        self.gone.send_replace(true);
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> u16 {
        self.lock().status
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.lock()
            .headers
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    pub fn body(&self) -> String {
        String::from_utf8_lossy(&self.lock().body).into_owned()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.lock().events.clone()
    }

    pub fn flush_count(&self) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|e| matches!(e, SinkEvent::Flush { .. }))
            .count()
    }
}

impl MemoryState {
    fn elapsed_ms(&self) -> u64 {
        self.created.elapsed().as_millis() as u64
    }

    fn commit(&mut self) {
        self.headers_sent = true;
        self.committed = self.body.len();
    }
}

impl ResponseSink for MemorySink {
    fn set_status(&mut self, status: u16) -> bool {
        let mut state = self.lock();
        if state.headers_sent {
            return false;
        }
        state.status = status;
        true
    }

    fn set_header(&mut self, name: &str, value: &str) -> bool {
        let mut state = self.lock();
        if state.headers_sent {
            return false;
        }
        state.headers.push((name.to_string(), value.to_string()));
        true
    }

    fn headers_sent(&self) -> bool {
        self.lock().headers_sent
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        let mut state = self.lock();
        if state.closed {
            return Err(SinkError::Disconnected);
        }
        state.body.extend_from_slice(chunk);
        let at_ms = state.elapsed_ms();
        state.events.push(SinkEvent::Write {
            text: String::from_utf8_lossy(chunk).into_owned(),
            at_ms,
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        let mut state = self.lock();
        if state.closed {
            return Err(SinkError::Disconnected);
        }
        state.commit();
        let at_ms = state.elapsed_ms();
        state.events.push(SinkEvent::Flush { at_ms });
        Ok(())
    }

    fn reset(&mut self) {
        let mut state = self.lock();
        let committed = state.committed;
        state.body.truncate(committed);
    }

    fn close(&mut self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.commit();
        state.closed = true;
        let at_ms = state.elapsed_ms();
        state.events.push(SinkEvent::Close { at_ms });
    }

    fn bytes_written(&self) -> u64 {
        self.lock().body.len() as u64
    }

    fn disconnected(&self) -> BoxFuture<()> {
        let mut gone = self.gone.subscribe();
        Box::pin(async move {
            let _ = gone.wait_for(|gone| *gone).await;
        })
    }
}
