//! trickled — HTTP daemon for the trickle streaming renderer.
//!
//! Wires the render pipeline to axum: each page request gets its own
//! data cache and response session, the pipeline runs on a spawned task,
//! and its output is streamed back through a [`sink::ChannelSink`].

pub mod app;
pub mod demo;
pub mod routes;
pub mod sink;

pub use app::{AppState, build_router};
pub use routes::{Navigation, RequestContext, RouteTable};
