//! HTTP front end: axum router and the page handler.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/_trickle/active` | Number of responses currently rendering |
//! | GET | any other path | Resolved through the [`RouteTable`] and streamed |

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use trickle_core::TrickleConfig;
use trickle_render::{
    ActiveRequests, MemoryDataCache, PageDescriptor, ResponseSession, SessionOptions,
    timeout_from_query,
};

use crate::routes::{Navigation, RequestContext, RouteTable};
use crate::sink;

/// Shared state for request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<TrickleConfig>,
    pub routes: Arc<RouteTable>,
    pub active: ActiveRequests,
}

impl AppState {
    pub fn new(config: TrickleConfig, routes: RouteTable) -> Self {
        Self {
            config: Arc::new(config),
            routes: Arc::new(routes),
            active: ActiveRequests::new(),
        }
    }

    /// Per-request options, honouring the timeout override if enabled.
    pub fn session_options(&self, query: Option<&str>) -> SessionOptions {
        let render = &self.config.render;
        let render_timeout = if render.allow_timeout_override {
            timeout_from_query(query, &render.debug_timeout_param, render.render_timeout())
        } else {
            render.render_timeout()
        };
        SessionOptions {
            render_timeout,
            late_arrival_timeout: render.late_arrival_timeout(),
            client_config: self.config.client_config_json(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/_trickle/active", get(active_requests))
        .fallback(get(render_page))
        .with_state(state)
}

#[derive(serde::Serialize)]
struct ActiveResponse {
    active_requests: usize,
}

/// GET /_trickle/active
pub async fn active_requests(State(state): State<AppState>) -> impl IntoResponse {
    Json(ActiveResponse {
        active_requests: state.active.get(),
    })
}

/// GET everything else
pub async fn render_page(State(state): State<AppState>, uri: Uri) -> Response {
    let accepted = Instant::now();
    let cache = MemoryDataCache::new();
    let ctx = RequestContext {
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        cache: cache.clone(),
    };

    match state.routes.resolve(&ctx) {
        Navigation::Page(page) => stream_page(&state, ctx, page, accepted).await,
        Navigation::NotFound => {
            debug!(path = %ctx.path, "no route");
            (StatusCode::NOT_FOUND, "Not Found").into_response()
        }
        Navigation::Redirect { status, location } => {
            debug!(path = %ctx.path, %location, "redirecting");
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::FOUND);
            Response::builder()
                .status(status)
                .header(header::LOCATION, location)
                .body(Body::empty())
                .unwrap_or_else(|e| {
                    warn!(error = %e, "invalid redirect");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                })
        }
    }
}

async fn stream_page(
    state: &AppState,
    ctx: RequestContext,
    page: PageDescriptor,
    accepted: Instant,
) -> Response {
    let guard = state.active.acquire();
    info!(
        path = %ctx.path,
        route = %page.route_name,
        kind = page.kind.label(),
        active_requests = state.active.get(),
        "request start"
    );

    let (sink, handle) = sink::channel();
    let session = ResponseSession::new(
        sink,
        page.kind,
        Arc::new(ctx.cache),
        guard,
        state.session_options(ctx.query.as_deref()),
    )
    .with_start(accepted);

    tokio::spawn(trickle_render::render(session, page));
    handle.into_response().await
}
