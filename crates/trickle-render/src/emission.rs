//! Ordered emission buffer and the body stage that drives it.
//!
//! Render units resolve in any order. Each one runs on its own task and
//! reports `(index, result)` over a single channel; the body stage feeds
//! those into an [`EmissionBuffer`], which writes the longest contiguous
//! run starting at its cursor and holds everything after the first gap.
//!
//! ```text
//!  unit tasks ──(index, result)──▶ channel ──▶ EmissionBuffer ──▶ sink
//!                                    ▲
//!                 Deadline ──────────┘ (forces the rest out empty)
//! ```

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use trickle_core::{PageKind, RenderResult, Script, UnitError};

use crate::page::RenderUnit;
use crate::protocol::{self, ROOT_ID_ATTR, TIMING_OFFSET_ATTR};
use crate::session::ResponseSession;
use crate::sink::ResponseSink;
use crate::watchdog::Deadline;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Pending,
    Resolved(String),
    Written,
}

/// Resequences out-of-order unit results into index order.
#[derive(Debug)]
pub struct EmissionBuffer {
    slots: Vec<Slot>,
    cursor: usize,
}

impl EmissionBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            slots: vec![Slot::Pending; len],
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Index of the next unit to write.
    pub fn next_unwritten(&self) -> usize {
        self.cursor
    }

    /// True once every unit has been written.
    pub fn is_complete(&self) -> bool {
        self.cursor == self.slots.len()
    }

    /// Record the outcome of unit `index`. A failed unit becomes empty
    /// content. Returns `false` if the result was ignored because the
    /// unit already settled or the index is out of range.
    pub fn submit(&mut self, index: usize, result: Result<String, UnitError>) -> bool {
        let Some(slot) = self.slots.get_mut(index) else {
            warn!(index, "result for unknown unit ignored");
            return false;
        };
        if *slot != Slot::Pending {
            debug!(index, "result for settled unit ignored");
            return false;
        }
        let html = match result {
            Ok(html) => html,
            Err(e) => {
                error!(index, error = %e, "error rendering unit");
                String::new()
            }
        };
        *slot = Slot::Resolved(html);
        true
    }

    /// Write every resolved unit from the cursor up to the first pending
    /// one, then flush if anything was written.
    pub fn try_flush<S: ResponseSink>(
        &mut self,
        session: &mut ResponseSession<S>,
    ) -> RenderResult<usize> {
        self.write_run(session, false)
    }

    /// Write everything that is left, pending units as empty content, and
    /// tell the client no more data is coming.
    pub fn force_complete<S: ResponseSink>(
        &mut self,
        session: &mut ResponseSession<S>,
    ) -> RenderResult<usize> {
        let written = self.write_run(session, true)?;
        if session.kind() == PageKind::Page {
            session.enqueue_scripts(&[protocol::fail_arrival()])?;
            session.abandon_late_requests();
            session.flush();
        }
        Ok(written)
    }

    fn write_run<S: ResponseSink>(
        &mut self,
        session: &mut ResponseSession<S>,
        force: bool,
    ) -> RenderResult<usize> {
        let start = self.cursor;
        while self.cursor < self.slots.len() {
            let index = self.cursor;
            let html = match std::mem::replace(&mut self.slots[index], Slot::Written) {
                Slot::Resolved(html) => html,
                Slot::Pending if force => String::new(),
                Slot::Pending => {
                    self.slots[index] = Slot::Pending;
                    break;
                }
                Slot::Written => {
                    self.cursor += 1;
                    continue;
                }
            };

            // Millisecond resolution. Units written in the same run share
            // an offset, so offsets are non-decreasing, not strictly
            // increasing.
            session.write(format!(
                "<div {ROOT_ID_ATTR}={index} {TIMING_OFFSET_ATTR}=\"{}\">{html}</div>",
                session.timing_offset_ms()
            ));
            self.cursor += 1;

            if session.kind() == PageKind::Page {
                announce(session, index)?;
            }
        }

        let written = self.cursor - start;
        if written > 0 {
            session.flush();
        }
        Ok(written)
    }
}

/// Client notifications after unit `index` has been written.
fn announce<S: ResponseSink>(session: &mut ResponseSession<S>, index: usize) -> RenderResult<()> {
    let above_the_fold = session.above_the_fold();
    if index + 1 == above_the_fold {
        // Everything above the fold is in; the client may wake up.
        session.bootstrap_client()?;
        let arrivals: Vec<Script> = (0..=index).map(protocol::node_arrival).collect();
        session.enqueue_scripts(&arrivals)?;
    } else if index >= above_the_fold {
        session.enqueue_scripts(&[protocol::node_arrival(index)])?;
    }
    Ok(())
}

/// How the body stage finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyOutcome {
    /// Every unit resolved before the deadline.
    Completed,
    /// The deadline forced `missing` units out empty.
    TimedOut { missing: usize },
}

struct Arrival {
    index: usize,
    name: String,
    result: Result<String, UnitError>,
    elapsed: Duration,
}

/// Render `units` in order, bounded by `timeout` from the session start.
///
/// Unit tasks are not cancelled when the deadline fires; their results
/// are simply no longer read.
pub async fn write_body<S: ResponseSink>(
    session: &mut ResponseSession<S>,
    units: Vec<RenderUnit>,
    above_the_fold: usize,
    timeout: Duration,
) -> RenderResult<BodyOutcome> {
    let total = units.len();
    session.set_above_the_fold(above_the_fold.min(total.max(1)));

    let mut buffer = EmissionBuffer::new(total);
    let (tx, mut rx) = mpsc::unbounded_channel();
    for (index, unit) in units.into_iter().enumerate() {
        spawn_unit(index, unit, tx.clone());
    }
    drop(tx);

    let mut deadline = Deadline::arm(session.start(), timeout);
    while !buffer.is_complete() {
        tokio::select! {
            biased;
            arrival = rx.recv() => {
                let Some(arrival) = arrival else {
                    // Every unit task is gone without reporting.
                    warn!(next = buffer.next_unwritten(), "unit tasks ended early");
                    let missing = buffer.len() - buffer.next_unwritten();
                    buffer.force_complete(session)?;
                    return Ok(BodyOutcome::TimedOut { missing });
                };
                debug!(
                    unit = %arrival.name,
                    index = arrival.index,
                    render_element_ms = arrival.elapsed.as_millis() as u64,
                    from_start_ms = session.elapsed().as_millis() as u64,
                    "unit resolved"
                );
                session.record_render_time(arrival.elapsed);
                buffer.submit(arrival.index, arrival.result);
                buffer.try_flush(session)?;
            }
            _ = deadline.expired() => {
                let missing = buffer.len() - buffer.next_unwritten();
                warn!(
                    missing,
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out rendering, sending remaining units empty"
                );
                buffer.force_complete(session)?;
                return Ok(BodyOutcome::TimedOut { missing });
            }
        }
    }
    deadline.disarm();

    if total == 0 && session.kind() == PageKind::Page {
        session.bootstrap_client()?;
    }
    Ok(BodyOutcome::Completed)
}

fn spawn_unit(index: usize, unit: RenderUnit, tx: mpsc::UnboundedSender<Arrival>) {
    let (name, source) = unit.into_parts();
    tokio::spawn(async move {
        let started = Instant::now();
        let result = match tokio::spawn(source).await {
            Ok(result) => result,
            Err(e) => Err(UnitError::Panicked(e.to_string())),
        };
        let _ = tx.send(Arrival {
            index,
            name,
            result,
            elapsed: started.elapsed(),
        });
    });
}
