//! Late arrival tracker.
//!
//! Background fetches that were still outstanding when the client was
//! bootstrapped are followed after the body stage: each one that
//! resolves is pushed to the client as a keyed data notification through
//! the script chain. Waiting is bounded by the session's late arrival
//! timeout, measured from when tracking starts; whatever has not
//! resolved by then is abandoned and the client is sent nothing for it.
//! Tracking also stops as soon as the response is closed or the client
//! disconnects, whatever the timeout.

use std::collections::BTreeSet;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use trickle_core::RenderResult;

use crate::cache::PendingFetch;
use crate::protocol;
use crate::session::ResponseSession;
use crate::sink::ResponseSink;

/// What happened to the tracked fetches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LateArrivalSummary {
    /// Fetches delivered to the client.
    pub notified: usize,
    /// Fetches that resolved with an error.
    pub failed: usize,
    /// Fetches still pending when tracking stopped.
    pub abandoned: usize,
}

pub struct LateArrivalTracker {
    fetches: Vec<PendingFetch>,
    max_wait: Option<Duration>,
}

impl LateArrivalTracker {
    pub fn new(fetches: Vec<PendingFetch>, max_wait: Option<Duration>) -> Self {
        Self { fetches, max_wait }
    }

    /// Take over the fetches the session captured at bootstrap.
    pub fn from_session<S: ResponseSink>(session: &mut ResponseSession<S>) -> Self {
        let max_wait = session.options().late_arrival_timeout;
        Self::new(session.take_late_requests(), max_wait)
    }

    pub fn len(&self) -> usize {
        self.fetches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetches.is_empty()
    }

    /// Notify the client of each fetch as it resolves. Settles when all
    /// fetches settled, the wait bound elapsed, or the sink closed.
    pub async fn run<S: ResponseSink>(
        self,
        session: &mut ResponseSession<S>,
    ) -> RenderResult<LateArrivalSummary> {
        let mut summary = LateArrivalSummary::default();
        if self.fetches.is_empty() {
            return Ok(summary);
        }
        if session.sink().is_closed() {
            debug!(
                count = self.fetches.len(),
                "response already closed, abandoning late fetches"
            );
            summary.abandoned = self.fetches.len();
            return Ok(summary);
        }

        let max_wait = self.max_wait;
        let mut outstanding: BTreeSet<String> =
            self.fetches.iter().map(|f| f.key.clone()).collect();
        let mut pending: FuturesUnordered<_> = self
            .fetches
            .into_iter()
            .map(|fetch| async move { (fetch.key, fetch.ready.await) })
            .collect();

        debug!(count = outstanding.len(), "waiting for late arrivals");

        let give_up = async {
            match max_wait {
                Some(max_wait) => tokio::time::sleep(max_wait).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(give_up);
        let mut disconnected = session.sink().disconnected();

        loop {
            tokio::select! {
                next = pending.next() => {
                    let Some((key, result)) = next else {
                        break;
                    };
                    outstanding.remove(&key);
                    match result {
                        Ok(payload) => {
                            if session.sink().is_closed() {
                                debug!(%key, "response closed, dropping late arrival");
                                break;
                            }
                            info!(
                                %key,
                                late_arrival_ms = session.elapsed().as_millis() as u64,
                                "late arrival"
                            );
                            session.enqueue_scripts(&[protocol::data_arrival(&key, &payload)])?;
                            session.flush();
                            summary.notified += 1;
                        }
                        Err(e) => {
                            warn!(%key, error = %e, "late fetch failed");
                            summary.failed += 1;
                        }
                    }
                }
                _ = &mut give_up => {
                    warn!(
                        abandoned = ?outstanding,
                        "late arrival wait exceeded, abandoning pending fetches"
                    );
                    break;
                }
                _ = &mut disconnected => {
                    session.sink_mut().mark_disconnected();
                    warn!(
                        abandoned = ?outstanding,
                        "client disconnected, abandoning pending fetches"
                    );
                    break;
                }
            }
        }

        summary.abandoned = outstanding.len();
        Ok(summary)
    }
}
