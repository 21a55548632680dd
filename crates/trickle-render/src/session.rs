//! Per-response session state.
//!
//! A [`ResponseSession`] is created when a request starts rendering and
//! is passed explicitly to every lifecycle stage. It is the single owner
//! of the output sink, the script chain tail and the late-request set.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use trickle_core::{PageKind, RenderResult, Script};

use crate::active::ActiveRequestGuard;
use crate::cache::{DataCache, PendingFetch};
use crate::protocol;
use crate::sequencer::{self, ChainToken};
use crate::sink::{GuardedSink, ResponseSink};

/// Per-request knobs resolved before the pipeline starts.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Budget for the body stage, measured from request start.
    pub render_timeout: Duration,
    /// Bound on the late arrival stage; `None` waits indefinitely.
    pub late_arrival_timeout: Option<Duration>,
    /// Non-internal configuration exposed at bootstrap.
    pub client_config: Value,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            render_timeout: Duration::from_secs(20),
            late_arrival_timeout: Some(Duration::from_secs(20)),
            client_config: Value::Object(Default::default()),
        }
    }
}

/// Background fetches outstanding when the client was bootstrapped.
enum LateSet {
    NotCaptured,
    Captured(Vec<PendingFetch>),
    Abandoned,
}

pub struct ResponseSession<S> {
    sink: GuardedSink<S>,
    kind: PageKind,
    start: Instant,
    timing_t0: Option<Instant>,
    above_the_fold: usize,
    chain: Option<ChainToken>,
    bootstrap_sent: bool,
    first_flush_logged: bool,
    late: LateSet,
    late_count: usize,
    data_cache: Arc<dyn DataCache>,
    options: SessionOptions,
    render_time: Duration,
    guard: Option<ActiveRequestGuard>,
}

impl<S: ResponseSink> ResponseSession<S> {
    pub fn new(
        sink: S,
        kind: PageKind,
        data_cache: Arc<dyn DataCache>,
        guard: ActiveRequestGuard,
        options: SessionOptions,
    ) -> Self {
        Self {
            sink: GuardedSink::new(sink),
            kind,
            start: Instant::now(),
            timing_t0: None,
            above_the_fold: 1,
            chain: Some(ChainToken::new()),
            bootstrap_sent: false,
            first_flush_logged: false,
            late: LateSet::NotCaptured,
            late_count: 0,
            data_cache,
            options,
            render_time: Duration::ZERO,
            guard: Some(guard),
        }
    }

    /// Backdate the request start, e.g. to when the request was accepted.
    pub fn with_start(mut self, start: Instant) -> Self {
        self.start = start;
        self
    }

    pub fn kind(&self) -> PageKind {
        self.kind
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn data_cache(&self) -> &Arc<dyn DataCache> {
        &self.data_cache
    }

    pub fn sink(&self) -> &GuardedSink<S> {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut GuardedSink<S> {
        &mut self.sink
    }

    pub fn write(&mut self, chunk: impl AsRef<[u8]>) {
        self.sink.write(chunk);
    }

    pub fn flush(&mut self) {
        if self.sink.flush() && !self.first_flush_logged {
            self.first_flush_logged = true;
            info!(
                first_flush_ms = self.elapsed().as_millis() as u64,
                "first flush"
            );
        }
    }

    pub fn above_the_fold(&self) -> usize {
        self.above_the_fold
    }

    pub(crate) fn set_above_the_fold(&mut self, count: usize) {
        self.above_the_fold = count.max(1);
    }

    /// Start the clock that unit timing offsets are measured against.
    pub(crate) fn mark_timing_start(&mut self) {
        self.timing_t0 = Some(Instant::now());
    }

    /// Milliseconds since the timing origin (or request start).
    pub fn timing_offset_ms(&self) -> u64 {
        self.timing_t0.unwrap_or(self.start).elapsed().as_millis() as u64
    }

    pub(crate) fn record_render_time(&mut self, elapsed: Duration) {
        self.render_time += elapsed;
    }

    pub fn render_time(&self) -> Duration {
        self.render_time
    }

    /// Append `scripts` to this response's script chain.
    pub fn enqueue_scripts(&mut self, scripts: &[Script]) -> RenderResult<()> {
        let token = self.chain.take().unwrap_or_default();
        match sequencer::enqueue(token, scripts, &mut self.sink) {
            Ok(token) => {
                self.chain = Some(token);
                Ok(())
            }
            Err(e) => {
                self.chain = Some(e.token);
                Err(e.source)
            }
        }
    }

    pub fn bootstrap_sent(&self) -> bool {
        self.bootstrap_sent
    }

    /// Send the client its initial state and start it. Runs at most once.
    ///
    /// The fetches still outstanding at this point are captured for the
    /// late arrival stage in the same step, so no resolution can slip in
    /// between the snapshot and the subscription.
    pub fn bootstrap_client(&mut self) -> RenderResult<()> {
        if self.bootstrap_sent {
            return Ok(());
        }
        let snapshot = self.data_cache.dehydrate();
        let script = protocol::bootstrap(snapshot, self.options.client_config.clone());
        self.enqueue_scripts(&[script])?;
        self.bootstrap_sent = true;

        let pending = self.data_cache.pending_requests();
        self.data_cache.mark_late_requests();
        self.late_count = pending.len();
        debug!(late_requests = pending.len(), "client bootstrapped");
        self.late = LateSet::Captured(pending);
        Ok(())
    }

    /// Stop waiting for late fetches; nothing more will be sent for them.
    pub(crate) fn abandon_late_requests(&mut self) {
        if let LateSet::Captured(pending) = &self.late {
            debug!(abandoned = pending.len(), "late requests abandoned");
        }
        self.late = LateSet::Abandoned;
    }

    pub(crate) fn take_late_requests(&mut self) -> Vec<PendingFetch> {
        match std::mem::replace(&mut self.late, LateSet::Abandoned) {
            LateSet::Captured(pending) => pending,
            LateSet::NotCaptured | LateSet::Abandoned => Vec::new(),
        }
    }

    /// Fetches that were still pending at bootstrap.
    pub fn late_request_count(&self) -> usize {
        self.late_count
    }

    /// Release the active-request slot. Later calls do nothing.
    pub(crate) fn release_active(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            guard.release();
        }
    }

    pub fn into_sink(self) -> S {
        self.sink.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::active::ActiveRequests;
    use crate::cache::MemoryDataCache;
    use crate::sink::MemorySink;
    use serde_json::json;

    fn session(cache: MemoryDataCache) -> (MemorySink, ActiveRequests, ResponseSession<MemorySink>) {
        let memory = MemorySink::new();
        let active = ActiveRequests::new();
        let session = ResponseSession::new(
            memory.clone(),
            PageKind::Page,
            Arc::new(cache),
            active.acquire(),
            SessionOptions::default(),
        );
        (memory, active, session)
    }

    #[tokio::test]
    async fn bootstrap_runs_once_and_captures_pending() {
        let cache = MemoryDataCache::new();
        cache.resolve("ready", json!(1));
        cache.register("slow");
        let (memory, _active, mut session) = session(cache.clone());

        session.bootstrap_client().unwrap();
        session.bootstrap_client().unwrap();

        let body = memory.body();
        assert_eq!(body.matches("trickleBootstrap()").count(), 1);
        assert_eq!(session.late_request_count(), 1);
        assert_eq!(cache.late_request_count(), 1);

        let late = session.take_late_requests();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].key, "slow");
        assert!(session.take_late_requests().is_empty());
    }

    #[tokio::test]
    async fn abandoned_late_requests_are_not_returned() {
        let cache = MemoryDataCache::new();
        cache.register("slow");
        let (_memory, _active, mut session) = session(cache);

        session.bootstrap_client().unwrap();
        session.abandon_late_requests();
        assert!(session.take_late_requests().is_empty());
    }

    #[tokio::test]
    async fn release_active_is_idempotent() {
        let (_memory, active, mut session) = session(MemoryDataCache::new());
        assert_eq!(active.get(), 1);
        session.release_active();
        session.release_active();
        assert_eq!(active.get(), 0);
        drop(session);
        assert_eq!(active.get(), 0);
    }

    #[tokio::test]
    async fn chain_survives_rejected_batch() {
        let (memory, _active, mut session) = session(MemoryDataCache::new());
        session.enqueue_scripts(&[Script::inline("a()")]).unwrap();
        assert!(session.enqueue_scripts(&[Script::default()]).is_err());
        session.enqueue_scripts(&[Script::inline("b()")]).unwrap();

        let body = memory.body();
        assert_eq!(body.matches("$trickleChain=new C").count(), 1);
        assert!(body.contains("_tChain=_tChain.wait(function(){try{b()}"));
    }
}
