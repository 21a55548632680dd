//! Lifecycle pipeline executor.
//!
//! A response is produced by a fixed, kind-specific sequence of stages
//! run strictly one after another. The first stage error stops the
//! sequence; the response is then failed (500 if nothing was committed
//! yet) and the completion stage runs. Completion runs exactly once on
//! every path.

use std::fmt;
use std::mem;

use futures_util::future::try_join_all;
use tokio::time::Instant;
use tracing::{debug, error, info};

use trickle_core::{PageKind, RenderError, RenderResult, Script};

use crate::emission::{self, BodyOutcome};
use crate::head;
use crate::late::{LateArrivalSummary, LateArrivalTracker};
use crate::page::{PageDescriptor, ResponseStats};
use crate::protocol::{self, CONTENT_NODE_ATTR};
use crate::sequencer;
use crate::session::ResponseSession;
use crate::sink::ResponseSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    SetContentType,
    WriteHeader,
    StartBody,
    WriteBody,
    WrapUpLateArrivals,
    CloseBody,
    EndResponse,
    WriteDebugComments,
    WriteResponseData,
    HandleComplete,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::SetContentType => "set_content_type",
            Stage::WriteHeader => "write_header",
            Stage::StartBody => "start_body",
            Stage::WriteBody => "write_body",
            Stage::WrapUpLateArrivals => "wrap_up_late_arrivals",
            Stage::CloseBody => "close_body",
            Stage::EndResponse => "end_response",
            Stage::WriteDebugComments => "write_debug_comments",
            Stage::WriteResponseData => "write_response_data",
            Stage::HandleComplete => "handle_complete",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const PAGE_STAGES: &[Stage] = &[
    Stage::SetContentType,
    Stage::WriteHeader,
    Stage::StartBody,
    Stage::WriteBody,
    Stage::WrapUpLateArrivals,
    Stage::CloseBody,
    Stage::EndResponse,
];

const FRAGMENT_STAGES: &[Stage] = &[
    Stage::SetContentType,
    Stage::WriteDebugComments,
    Stage::WriteBody,
    Stage::EndResponse,
];

const RAW_STAGES: &[Stage] = &[
    Stage::SetContentType,
    Stage::WriteResponseData,
    Stage::EndResponse,
];

/// Stages run for `kind`, not counting completion.
pub fn stages_for(kind: PageKind) -> &'static [Stage] {
    match kind {
        PageKind::Page => PAGE_STAGES,
        PageKind::Fragment => FRAGMENT_STAGES,
        PageKind::Raw => RAW_STAGES,
    }
}

#[derive(Debug)]
pub enum PipelineState {
    Pending,
    Running(Stage),
    Completed,
    Failed { stage: Stage, error: RenderError },
}

impl PipelineState {
    pub fn is_failed(&self) -> bool {
        matches!(self, PipelineState::Failed { .. })
    }
}

/// Result of running a pipeline to completion.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub state: PipelineState,
    pub stats: ResponseStats,
    pub stages_run: Vec<Stage>,
    pub body: Option<BodyOutcome>,
    pub late_arrivals: Option<LateArrivalSummary>,
}

pub struct Pipeline<S> {
    session: ResponseSession<S>,
    page: PageDescriptor,
    state: PipelineState,
    status: u16,
    stages_run: Vec<Stage>,
    body: Option<BodyOutcome>,
    late_arrivals: Option<LateArrivalSummary>,
}

impl<S: ResponseSink> Pipeline<S> {
    pub fn new(session: ResponseSession<S>, page: PageDescriptor) -> Self {
        let status = page.status;
        Self {
            session,
            page,
            state: PipelineState::Pending,
            status,
            stages_run: Vec::new(),
            body: None,
            late_arrivals: None,
        }
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Run every stage for the page's kind, then completion.
    pub async fn run(mut self) -> PipelineOutcome {
        let kind = self.page.kind;
        debug!(
            kind = kind.label(),
            route = %self.page.route_name,
            units = self.page.units.len(),
            "pipeline starting"
        );

        for &stage in stages_for(kind) {
            self.state = PipelineState::Running(stage);
            let started = Instant::now();
            match self.run_stage(stage).await {
                Ok(()) => {
                    self.stages_run.push(stage);
                    debug!(
                        %stage,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "stage complete"
                    );
                }
                Err(e) => {
                    let e = e.in_stage(stage.name());
                    error!(%stage, error = %e, "error in lifecycle, failing response");
                    if !self.session.sink().headers_sent() {
                        self.status = 500;
                    }
                    self.session.sink_mut().fail(500);
                    self.state = PipelineState::Failed { stage, error: e };
                    break;
                }
            }
        }
        if !self.state.is_failed() {
            self.state = PipelineState::Completed;
        }

        let stats = self.handle_complete();
        PipelineOutcome {
            state: self.state,
            stats,
            stages_run: self.stages_run,
            body: self.body,
            late_arrivals: self.late_arrivals,
        }
    }

    async fn run_stage(&mut self, stage: Stage) -> RenderResult<()> {
        match stage {
            Stage::SetContentType => {
                self.session.sink_mut().set_status(self.page.status);
                let content_type = self.page.content_type.clone();
                self.session
                    .sink_mut()
                    .set_header("Content-Type", &content_type);
                Ok(())
            }
            Stage::WriteHeader => self.write_header().await,
            Stage::StartBody => self.start_body().await,
            Stage::WriteBody => {
                let units = mem::take(&mut self.page.units);
                let above_the_fold = self.page.above_the_fold_count();
                let timeout = self.session.options().render_timeout;
                let outcome =
                    emission::write_body(&mut self.session, units, above_the_fold, timeout).await?;
                self.body = Some(outcome);
                Ok(())
            }
            Stage::WrapUpLateArrivals => {
                let tracker = LateArrivalTracker::from_session(&mut self.session);
                let summary = tracker.run(&mut self.session).await?;
                self.late_arrivals = Some(summary);
                Ok(())
            }
            Stage::CloseBody => {
                self.session.write("</div></body></html>");
                Ok(())
            }
            Stage::EndResponse => {
                self.session.sink_mut().close();
                Ok(())
            }
            Stage::WriteDebugComments => {
                let comments = head::debug_comments(&self.page.debug_comments);
                self.session.write(comments);
                Ok(())
            }
            Stage::WriteResponseData => {
                if let Some(data) = self.page.response_data.take() {
                    if let Some(bytes) = data.await? {
                        self.session.write(bytes);
                    }
                }
                Ok(())
            }
            // Runs after the stage list, on every path.
            Stage::HandleComplete => Ok(()),
        }
    }

    async fn write_header(&mut self) -> RenderResult<()> {
        let session = &mut self.session;
        let page = &mut self.page;

        session.sink_mut().set_header("Transfer-Encoding", "chunked");
        session.write("<!DOCTYPE html><html><head>");
        session.write(head::debug_comments(&page.debug_comments));

        sequencer::render_sync(&[protocol::timing_start()], session.sink_mut())?;
        session.mark_timing_start();

        if let Some(title) = page.title.take() {
            session.write(head::title(&title.await?));
        }
        session.write(head::stylesheets(&page.stylesheets)?);

        let scripts: Vec<Script> = page
            .system_scripts
            .iter()
            .chain(page.scripts.iter())
            .cloned()
            .collect();
        session.enqueue_scripts(&scripts)?;

        let meta_tags = try_join_all(mem::take(&mut page.meta_tags)).await?;
        let mut tags = String::new();
        for tag in meta_tags.iter().flatten() {
            tags.push_str(&head::meta_tag(tag)?);
        }
        let link_tags = try_join_all(mem::take(&mut page.link_tags)).await?;
        for tag in link_tags.iter().flatten() {
            tags.push_str(&head::link_tag(tag)?);
        }
        if let Some(base) = page.base_tag.take() {
            if let Some(base) = base.await? {
                tags.push_str(&head::base_tag(&base)?);
            }
        }
        session.write(tags);

        session.write("</head>");
        session.flush();
        Ok(())
    }

    async fn start_body(&mut self) -> RenderResult<()> {
        let mut classes = match self.page.body_classes.take() {
            Some(classes) => classes.await?,
            None => Vec::new(),
        };
        classes.push(format!("route-{}", self.page.route_name));
        self.session
            .write(format!("<body class='{}'>", classes.join(" ")));

        if let Some(content) = self.page.body_start_content.take() {
            for chunk in content.await? {
                self.session.write(chunk);
            }
        }
        self.session
            .write(format!("<div id='content' {CONTENT_NODE_ATTR}>"));
        Ok(())
    }

    fn handle_complete(&mut self) -> ResponseStats {
        self.session.release_active();

        let stats = ResponseStats {
            status: self.status,
            failed: self.state.is_failed(),
            total_ms: self.session.elapsed().as_millis() as u64,
            bytes_written: self.session.sink().bytes_written(),
            late_arrivals: self.session.late_request_count(),
        };
        info!(
            status = stats.status,
            failed = stats.failed,
            total_request_ms = stats.total_ms,
            total_render_ms = self.session.render_time().as_millis() as u64,
            count_data_requests = self.session.data_cache().request_count(),
            count_late_arrivals = stats.late_arrivals,
            bytes_written = stats.bytes_written,
            "request complete"
        );
        if let Some(hook) = self.page.on_complete.take() {
            hook(&stats);
        }
        self.stages_run.push(Stage::HandleComplete);
        stats
    }
}

/// Render `page` into `session`'s sink.
pub async fn render<S: ResponseSink>(
    session: ResponseSession<S>,
    page: PageDescriptor,
) -> PipelineOutcome {
    Pipeline::new(session, page).run().await
}
