//! trickle-render — ordered streaming page renderer.
//!
//! A page is a sequence of independently computed render units. The
//! pipeline starts every unit at once, writes the document head
//! immediately, and streams units to the client strictly in index order
//! as the earliest unwritten one becomes available:
//!
//! ```text
//!  PageDescriptor ─▶ Pipeline ── stages ──▶ ResponseSession ─▶ GuardedSink ─▶ client
//!                                  │              ▲
//!                                  │              ├── script sequencer (chain token)
//!                                  ▼              │
//!                     unit tasks ─▶ EmissionBuffer ◀── Deadline
//!                                                 │
//!                     DataCache ─▶ LateArrivalTracker
//! ```
//!
//! - **sink**: transport abstraction plus the closed-state write guard
//! - **sequencer**: ordered client script execution across batches
//! - **emission**: out-of-order results resequenced into index order
//! - **watchdog**: the per-response body deadline
//! - **late**: background fetches delivered after the body
//! - **lifecycle**: the kind-specific stage sequence and completion

pub mod active;
pub mod cache;
pub mod emission;
pub mod escape;
pub mod head;
pub mod late;
pub mod lifecycle;
pub mod page;
pub mod protocol;
pub mod sequencer;
pub mod session;
pub mod sink;
pub mod watchdog;

pub use active::{ActiveRequestGuard, ActiveRequests};
pub use cache::{DataCache, MemoryDataCache, PendingFetch};
pub use emission::{BodyOutcome, EmissionBuffer};
pub use late::{LateArrivalSummary, LateArrivalTracker};
pub use lifecycle::{Pipeline, PipelineOutcome, PipelineState, Stage, render, stages_for};
pub use page::{BoxFuture, PageDescriptor, RenderUnit, ResponseStats};
pub use session::{ResponseSession, SessionOptions};
pub use sink::{GuardedSink, MemorySink, ResponseSink, SinkError, SinkEvent};
pub use watchdog::{Deadline, timeout_from_query};
