//! End-to-end tests for the render pipeline against an in-memory sink.
//!
//! All timing tests run on a paused clock, so unit delays and deadlines
//! are exact up to scheduling slack.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use trickle_core::{DebugComment, MetaTag, PageKind, RenderError, Script, UnitError};
use trickle_render::{
    ActiveRequests, BodyOutcome, MemoryDataCache, MemorySink, PageDescriptor, PipelineOutcome,
    PipelineState, RenderUnit, ResponseSession, ResponseStats, SessionOptions, Stage, render,
};

struct Harness {
    memory: MemorySink,
    active: ActiveRequests,
    cache: MemoryDataCache,
}

impl Harness {
    fn new() -> Self {
        Self {
            memory: MemorySink::new(),
            active: ActiveRequests::new(),
            cache: MemoryDataCache::new(),
        }
    }

    fn session(&self, kind: PageKind, options: SessionOptions) -> ResponseSession<MemorySink> {
        ResponseSession::new(
            self.memory.clone(),
            kind,
            Arc::new(self.cache.clone()),
            self.active.acquire(),
            options,
        )
    }

    async fn render(&self, page: PageDescriptor, options: SessionOptions) -> PipelineOutcome {
        let session = self.session(page.kind, options);
        assert_eq!(self.active.get(), 1);
        render(session, page).await
    }
}

fn delayed(name: &str, ms: u64, html: &str) -> RenderUnit {
    let html = html.to_string();
    RenderUnit::new(name, async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(html)
    })
}

fn never(name: &str) -> RenderUnit {
    RenderUnit::new(name, std::future::pending())
}

fn root_ids(html: &str) -> Vec<usize> {
    html.split("data-trickle-root-id=")
        .skip(1)
        .map(|s| s[..s.find(' ').unwrap()].parse().unwrap())
        .collect()
}

fn timing_offsets(html: &str) -> Vec<u64> {
    html.split("data-trickle-timing-offset=\"")
        .skip(1)
        .map(|s| s[..s.find('"').unwrap()].parse().unwrap())
        .collect()
}

fn pos(body: &str, needle: &str) -> usize {
    body.find(needle)
        .unwrap_or_else(|| panic!("{needle:?} not found in {body}"))
}

fn recording_hook() -> (Arc<Mutex<Vec<ResponseStats>>>, impl FnOnce(&ResponseStats) + Send) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    (calls, move |stats: &ResponseStats| {
        sink.lock().unwrap().push(stats.clone())
    })
}

// ── Ordering ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn units_emitted_in_index_order_for_any_completion_order() {
    let delays = [30, 10, 40, 0, 20];
    let harness = Harness::new();
    let mut page = PageDescriptor::page("home");
    for (i, ms) in delays.iter().enumerate() {
        page = page.with_unit(delayed(&format!("u{i}"), *ms, &format!("unit-{i}")));
    }

    let outcome = harness.render(page, SessionOptions::default()).await;
    assert!(matches!(outcome.state, PipelineState::Completed));
    assert_eq!(outcome.body, Some(BodyOutcome::Completed));

    let body = harness.memory.body();
    assert_eq!(root_ids(&body), vec![0, 1, 2, 3, 4]);
    let offsets = timing_offsets(&body);
    assert!(offsets.windows(2).all(|w| w[0] <= w[1]), "{offsets:?}");
    // Unit 0 gates everything until 30ms, unit 2 until 40ms.
    assert!(offsets[0] >= 30 && offsets[0] < 35);
    assert!(offsets[2] >= 40 && offsets[2] < 45);
    for i in 0..delays.len() {
        assert_eq!(body.matches(&format!(">unit-{i}</div>")).count(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn three_units_one_above_the_fold() {
    let harness = Harness::new();
    let page = PageDescriptor::page("home")
        .with_above_the_fold(1)
        .with_unit(delayed("a", 10, "A"))
        .with_unit(delayed("b", 5, "B"))
        .with_unit(delayed("c", 20, "C"));

    harness.render(page, SessionOptions::default()).await;
    let body = harness.memory.body();

    let head_end = pos(&body, "</head>");
    let unit_a = pos(&body, ">A</div>");
    let bootstrap = pos(&body, "trickleBootstrap();");
    let arrival_a = pos(&body, "__trickleNodeArrival(0)");
    let unit_b = pos(&body, ">B</div>");
    let arrival_b = pos(&body, "__trickleNodeArrival(1)");
    let unit_c = pos(&body, ">C</div>");
    let arrival_c = pos(&body, "__trickleNodeArrival(2)");

    assert!(head_end < unit_a);
    assert!(unit_a < bootstrap && bootstrap < arrival_a);
    assert!(arrival_a < unit_b && unit_b < arrival_b);
    assert!(arrival_b < unit_c && unit_c < arrival_c);
    assert_eq!(body.matches("trickleBootstrap();").count(), 1);
    assert!(!body.contains("__trickleFailArrival"));
    assert!(body.ends_with("</div></body></html>"));

    // A and B go out together at 10ms, C alone at 20ms.
    let offsets = timing_offsets(&body);
    assert_eq!(offsets[0], offsets[1]);
    assert!(offsets[2] >= 20);
}

#[tokio::test(start_paused = true)]
async fn later_unit_waits_for_earlier_gap() {
    let harness = Harness::new();
    let page = PageDescriptor::page("home")
        .with_above_the_fold(1)
        .with_unit(delayed("a", 0, "A"))
        .with_unit(delayed("b", 15, "B"))
        .with_unit(delayed("c", 5, "C"));

    harness.render(page, SessionOptions::default()).await;
    let body = harness.memory.body();

    assert_eq!(root_ids(&body), vec![0, 1, 2]);
    assert!(pos(&body, ">A</div>") < pos(&body, "trickleBootstrap();"));
    assert!(pos(&body, "trickleBootstrap();") < pos(&body, ">B</div>"));
    assert!(pos(&body, ">B</div>") < pos(&body, ">C</div>"));

    // C is held until B fills the gap at 15ms; both go out together.
    let offsets = timing_offsets(&body);
    assert!(offsets[0] < 5);
    assert!(offsets[1] >= 15 && offsets[1] < 20);
    assert_eq!(offsets[1], offsets[2]);
}

#[tokio::test(start_paused = true)]
async fn above_the_fold_batch_announced_together() {
    let harness = Harness::new();
    let page = PageDescriptor::page("home")
        .with_above_the_fold(2)
        .with_unit(delayed("a", 0, "A"))
        .with_unit(delayed("b", 10, "B"))
        .with_unit(delayed("c", 20, "C"));

    harness.render(page, SessionOptions::default()).await;
    let body = harness.memory.body();

    let unit_b = pos(&body, ">B</div>");
    assert!(pos(&body, "__trickleNodeArrival(0)") > unit_b);
    assert!(pos(&body, "trickleBootstrap();") > unit_b);
    assert!(pos(&body, "__trickleNodeArrival(1)") < pos(&body, ">C</div>"));
}

// ── Deadline ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn deadline_forces_remaining_units_out_empty() {
    let harness = Harness::new();
    let (calls, hook) = recording_hook();
    let page = PageDescriptor::page("slow")
        .with_unit(delayed("a", 10, "A"))
        .with_unit(never("b"))
        .with_unit(delayed("c", 5, "C"))
        .on_complete(hook);
    let options = SessionOptions {
        render_timeout: Duration::from_millis(50),
        ..SessionOptions::default()
    };

    let outcome = harness.render(page, options).await;
    assert!(matches!(outcome.state, PipelineState::Completed));
    assert_eq!(outcome.body, Some(BodyOutcome::TimedOut { missing: 2 }));
    assert!(outcome.stats.total_ms >= 50 && outcome.stats.total_ms < 55);

    let body = harness.memory.body();
    assert_eq!(root_ids(&body), vec![0, 1, 2]);
    assert!(body.contains(r#"data-trickle-root-id=1 data-trickle-timing-offset="#));
    assert!(body.contains(">C</div>"));
    assert_eq!(body.matches("__trickleFailArrival()").count(), 1);
    assert_eq!(body.matches("trickleBootstrap();").count(), 1);
    assert!(pos(&body, ">C</div>") < pos(&body, "__trickleFailArrival()"));
    assert!(body.ends_with("</div></body></html>"));
    assert!(harness.memory.is_closed());

    assert_eq!(calls.lock().unwrap().len(), 1);
    assert_eq!(harness.active.get(), 0);
}

#[tokio::test(start_paused = true)]
async fn deadline_settles_at_budget_not_before() {
    let harness = Harness::new();
    let page = PageDescriptor::page("slow")
        .with_unit(delayed("a", 10, "A"))
        .with_unit(never("b"));
    let options = SessionOptions {
        render_timeout: Duration::from_millis(50),
        ..SessionOptions::default()
    };

    let outcome = harness.render(page, options).await;
    assert_eq!(outcome.body, Some(BodyOutcome::TimedOut { missing: 1 }));

    let body = harness.memory.body();
    let offsets = timing_offsets(&body);
    assert!(offsets[0] >= 10 && offsets[0] < 15, "{offsets:?}");
    assert!(offsets[1] >= 50 && offsets[1] < 55, "{offsets:?}");
    assert!(body.contains(r#"data-trickle-timing-offset=""#));
    assert!(pos(&body, ">A</div>") < pos(&body, "__trickleFailArrival()"));
    assert_eq!(body.matches("__trickleFailArrival()").count(), 1);
}

#[tokio::test(start_paused = true)]
async fn deadline_abandons_late_fetches() {
    let harness = Harness::new();
    harness.cache.register("/api/stuck");
    let page = PageDescriptor::page("slow")
        .with_unit(delayed("a", 5, "A"))
        .with_unit(never("b"));
    let options = SessionOptions {
        render_timeout: Duration::from_millis(30),
        late_arrival_timeout: None,
        ..SessionOptions::default()
    };

    let outcome = harness.render(page, options).await;
    assert_eq!(outcome.late_arrivals.unwrap().abandoned, 0);
    assert!(outcome.stats.total_ms < 35);
    assert!(!harness.memory.body().contains("__trickleDataArrival"));
}

// ── Late arrivals ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn late_fetch_notified_and_stalled_fetch_abandoned() {
    let harness = Harness::new();
    harness.cache.register("/api/slow");
    harness.cache.register("/api/never");
    let resolver = harness.cache.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        resolver.resolve("/api/slow", json!({ "items": [1, 2] }));
    });

    let page = PageDescriptor::page("feed").with_unit(delayed("a", 10, "A"));
    let options = SessionOptions {
        late_arrival_timeout: Some(Duration::from_millis(200)),
        ..SessionOptions::default()
    };

    let outcome = harness.render(page, options).await;
    let late = outcome.late_arrivals.unwrap();
    assert_eq!(late.notified, 1);
    assert_eq!(late.abandoned, 1);
    assert_eq!(outcome.stats.late_arrivals, 2);
    // Tracking starts after the 10ms body and is bounded at 200ms.
    assert!(outcome.stats.total_ms >= 210 && outcome.stats.total_ms < 215);

    let body = harness.memory.body();
    let snapshot = pos(&body, r#""/api/slow":{"status":"pending"}"#);
    let arrival = pos(&body, r#"__trickleDataArrival("/api/slow", "#);
    assert!(snapshot < arrival);
    assert!(arrival < pos(&body, "</div></body></html>"));
    assert!(!body.contains(r#"__trickleDataArrival("/api/never""#));
    assert_eq!(harness.active.get(), 0);
}

#[tokio::test(start_paused = true)]
async fn client_disconnect_ends_unbounded_late_wait() {
    let harness = Harness::new();
    harness.cache.register("/api/never");
    let client = harness.memory.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.disconnect();
    });

    let page = PageDescriptor::page("feed").with_unit(delayed("a", 10, "A"));
    let options = SessionOptions {
        late_arrival_timeout: None,
        ..SessionOptions::default()
    };

    let outcome = tokio::time::timeout(Duration::from_secs(3600), harness.render(page, options))
        .await
        .expect("pipeline kept waiting after the client left");
    assert!(matches!(outcome.state, PipelineState::Completed));
    assert_eq!(outcome.late_arrivals.unwrap().abandoned, 1);
    assert!(outcome.stats.total_ms >= 50 && outcome.stats.total_ms < 55);
    assert!(!harness.memory.body().contains("</body></html>"));
    assert_eq!(harness.active.get(), 0);
}

#[tokio::test(start_paused = true)]
async fn fetch_resolved_before_bootstrap_is_in_snapshot() {
    let harness = Harness::new();
    harness.cache.resolve("/api/fast", json!(7));

    let page = PageDescriptor::page("home").with_unit(delayed("a", 1, "A"));
    let outcome = harness.render(page, SessionOptions::default()).await;

    assert_eq!(outcome.stats.late_arrivals, 0);
    let body = harness.memory.body();
    assert!(body.contains(r#""/api/fast":{"data":7,"status":"ready"}"#));
    assert!(!body.contains("__trickleDataArrival"));
}

// ── Failures ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn failed_and_panicking_units_render_empty() {
    let harness = Harness::new();
    let page = PageDescriptor::page("home")
        .with_unit(RenderUnit::new("bad", async {
            Err(UnitError::Failed("backend down".into()))
        }))
        .with_unit(RenderUnit::new("panics", async {
            if true {
                panic!("unit blew up");
            }
            Ok(String::new())
        }))
        .with_unit(delayed("ok", 5, "OK"));

    let outcome = harness.render(page, SessionOptions::default()).await;
    assert!(matches!(outcome.state, PipelineState::Completed));
    assert_eq!(outcome.stats.status, 200);

    let body = harness.memory.body();
    assert_eq!(root_ids(&body), vec![0, 1, 2]);
    assert!(body.contains(">OK</div>"));
    assert!(!body.contains("__trickleFailArrival"));
}

#[tokio::test(start_paused = true)]
async fn header_failure_before_commit_yields_500() {
    let harness = Harness::new();
    let (calls, hook) = recording_hook();
    let invalid = MetaTag {
        name: Some("description".into()),
        ..MetaTag::default()
    };
    let page = PageDescriptor::page("broken")
        .with_title("never sent")
        .with_meta_tags(vec![invalid])
        .with_unit(delayed("a", 5, "A"))
        .on_complete(hook);

    let outcome = harness.render(page, SessionOptions::default()).await;
    match &outcome.state {
        PipelineState::Failed { stage, error } => {
            assert_eq!(*stage, Stage::WriteHeader);
            assert!(matches!(error, RenderError::Stage { stage: "write_header", .. }));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(
        outcome.stages_run,
        vec![Stage::SetContentType, Stage::HandleComplete]
    );

    assert_eq!(harness.memory.status(), 500);
    assert_eq!(harness.memory.body(), "");
    assert!(harness.memory.is_closed());

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].status, 500);
    assert!(calls[0].failed);
    assert_eq!(harness.active.get(), 0);
}

#[tokio::test(start_paused = true)]
async fn failure_after_commit_keeps_status_and_closes() {
    let harness = Harness::new();
    let mut page = PageDescriptor::page("broken").with_unit(delayed("a", 5, "A"));
    page.body_classes = Some(Box::pin(async {
        Err(RenderError::Data("classes unavailable".into()))
    }));

    let outcome = harness.render(page, SessionOptions::default()).await;
    assert!(matches!(
        outcome.state,
        PipelineState::Failed {
            stage: Stage::StartBody,
            ..
        }
    ));
    assert_eq!(outcome.stats.status, 200);
    assert_eq!(harness.memory.status(), 200);
    assert!(harness.memory.body().ends_with("</head>"));
    assert!(harness.memory.is_closed());
    assert_eq!(harness.active.get(), 0);
}

#[tokio::test(start_paused = true)]
async fn invalid_script_fails_header_stage() {
    let harness = Harness::new();
    let page = PageDescriptor::page("broken").with_script(Script::default());
    let outcome = harness.render(page, SessionOptions::default()).await;
    assert!(matches!(
        outcome.state,
        PipelineState::Failed {
            stage: Stage::WriteHeader,
            error: RenderError::Stage { .. },
        }
    ));
    assert_eq!(harness.memory.status(), 500);
}

// ── Head and bootstrap ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn head_written_and_flushed_before_any_unit() {
    let harness = Harness::new();
    let page = PageDescriptor::page("home")
        .with_title("Home")
        .with_script(Script::href("/app.js"))
        .with_meta_tags(vec![MetaTag::charset("utf-8")])
        .with_body_classes(vec!["dark".into()])
        .with_unit(delayed("a", 50, "A"));

    harness.render(page, SessionOptions::default()).await;
    let body = harness.memory.body();

    assert!(body.starts_with("<!DOCTYPE html><html><head>"));
    assert!(pos(&body, "__trickleTimingStart=new Date") < pos(&body, "<title>Home</title>"));
    assert!(body.contains(".script(\"/app.js\")"));
    assert!(body.contains("<body class='dark route-home'>"));
    assert!(body.contains("<div id='content' data-trickle-content>"));
    assert_eq!(harness.memory.header("Content-Type").unwrap(), "text/html; charset=utf-8");

    // The head goes out before the first unit resolves.
    let events = harness.memory.events();
    let first_flush = events
        .iter()
        .find_map(|e| match e {
            trickle_render::SinkEvent::Flush { at_ms } => Some(*at_ms),
            _ => None,
        })
        .unwrap();
    assert!(first_flush < 50);
}

#[tokio::test(start_paused = true)]
async fn bootstrap_once_with_oversized_above_the_fold() {
    let harness = Harness::new();
    let page = PageDescriptor::page("home")
        .with_above_the_fold(5)
        .with_unit(delayed("a", 5, "A"))
        .with_unit(delayed("b", 1, "B"));

    harness.render(page, SessionOptions::default()).await;
    let body = harness.memory.body();
    assert_eq!(body.matches("trickleBootstrap();").count(), 1);
    assert!(pos(&body, ">B</div>") < pos(&body, "trickleBootstrap();"));
    assert!(body.contains("__trickleNodeArrival(1)"));
}

#[tokio::test(start_paused = true)]
async fn page_without_units_still_bootstraps() {
    let harness = Harness::new();
    let outcome = harness
        .render(PageDescriptor::page("empty"), SessionOptions::default())
        .await;
    assert_eq!(outcome.body, Some(BodyOutcome::Completed));
    let body = harness.memory.body();
    assert_eq!(body.matches("trickleBootstrap();").count(), 1);
    assert!(root_ids(&body).is_empty());
}

#[tokio::test(start_paused = true)]
async fn client_config_exposed_at_bootstrap() {
    let harness = Harness::new();
    let options = SessionOptions {
        client_config: json!({ "apiBase": "/api" }),
        ..SessionOptions::default()
    };
    let page = PageDescriptor::page("home").with_unit(delayed("a", 1, "A"));
    harness.render(page, options).await;
    assert!(harness.memory.body().contains(r#""Config":{"apiBase":"/api"}"#));
}

// ── Other kinds ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn fragment_mode_writes_units_only() {
    let harness = Harness::new();
    let mut page = PageDescriptor::fragment("partial")
        .with_unit(delayed("a", 10, "A"))
        .with_unit(delayed("b", 1, "B"));
    page.debug_comments.push(DebugComment {
        label: "route".into(),
        value: "partial".into(),
    });

    let outcome = harness.render(page, SessionOptions::default()).await;
    assert!(matches!(outcome.state, PipelineState::Completed));
    assert_eq!(
        outcome.stages_run,
        vec![
            Stage::SetContentType,
            Stage::WriteDebugComments,
            Stage::WriteBody,
            Stage::EndResponse,
            Stage::HandleComplete,
        ]
    );

    let body = harness.memory.body();
    assert!(body.starts_with("<!-- route: partial -->"));
    assert_eq!(root_ids(&body), vec![0, 1]);
    assert!(!body.contains("<script"));
    assert!(!body.contains("<html"));
    assert!(harness.memory.is_closed());
}

#[tokio::test(start_paused = true)]
async fn raw_mode_passes_bytes_through() {
    let harness = Harness::new();
    let page = PageDescriptor::raw("data").with_response_data(async {
        tokio::time::sleep(Duration::from_millis(3)).await;
        Ok(Some(Bytes::from_static(b"{\"ok\":true}")))
    });

    let outcome = harness.render(page, SessionOptions::default()).await;
    assert!(matches!(outcome.state, PipelineState::Completed));
    assert_eq!(harness.memory.body(), "{\"ok\":true}");
    assert_eq!(
        harness.memory.header("Content-Type").unwrap(),
        "application/octet-stream"
    );
    assert!(outcome.body.is_none());
}

// ── Completion ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn completion_runs_once_and_releases_every_slot() {
    let active = ActiveRequests::new();
    let completions = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for i in 0..4u64 {
        let memory = MemorySink::new();
        let session = ResponseSession::new(
            memory,
            PageKind::Page,
            Arc::new(MemoryDataCache::new()),
            active.acquire(),
            SessionOptions {
                render_timeout: Duration::from_millis(20),
                ..SessionOptions::default()
            },
        );
        let count = completions.clone();
        let mut page = PageDescriptor::page("home")
            .on_complete(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .with_unit(delayed("a", i * 10, "A"));
        if i == 3 {
            page = page.with_meta_tags(vec![MetaTag {
                charset: Some("utf-8".into()),
                http_equiv: Some("refresh".into()),
                ..MetaTag::default()
            }]);
        }
        handles.push(tokio::spawn(render(session, page)));
    }
    assert_eq!(active.get(), 4);

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(completions.load(Ordering::SeqCst), 4);
    assert_eq!(active.get(), 0);
}
