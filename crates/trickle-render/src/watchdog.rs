//! Deadline watchdog for the body stage.
//!
//! One timer per response, armed from the request start. The body stage
//! races it against unit arrivals; [`Deadline::expired`] takes the
//! watchdog by mutable reference and [`Deadline::disarm`] consumes it, so
//! it can decide the outcome at most once.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep};
use tracing::{debug, warn};

pub struct Deadline {
    sleep: Pin<Box<Sleep>>,
    deadline: Instant,
    fired: bool,
}

impl Deadline {
    /// Arm a timer for whatever is left of `total` since `start`.
    pub fn arm(start: Instant, total: Duration) -> Self {
        let deadline = start + total;
        debug!(
            total_ms = total.as_millis() as u64,
            remaining_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
            "render deadline armed"
        );
        Self {
            sleep: Box::pin(tokio::time::sleep_until(deadline)),
            deadline,
            fired: false,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// Resolves when the deadline passes. Once it has fired it never
    /// resolves again.
    pub async fn expired(&mut self) {
        if self.fired {
            std::future::pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.fired = true;
    }

    /// Cancel the timer after natural completion.
    pub fn disarm(self) {
        debug!(
            remaining_ms = self.remaining().as_millis() as u64,
            "render deadline disarmed"
        );
    }
}

/// Resolve the body-stage budget for one request.
///
/// `query` is the raw query string; if it carries `param` with a
/// millisecond value, that value replaces `default`. Unparseable values
/// are ignored.
pub fn timeout_from_query(query: Option<&str>, param: &str, default: Duration) -> Duration {
    let Some(query) = query else {
        return default;
    };
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key != param {
            continue;
        }
        match value.parse::<u64>() {
            Ok(ms) => return Duration::from_millis(ms),
            Err(_) => {
                warn!(%param, %value, "ignoring invalid render timeout override");
                return default;
            }
        }
    }
    default
}
