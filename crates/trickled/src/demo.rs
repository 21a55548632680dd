//! Built-in demo pages.
//!
//! - `/` a full page: units with staggered delays, one unit that waits on
//!   a cache fetch, and a background fetch that lands after the body
//! - `/fragment` the same units without document wrapper or scripts
//! - `/raw` a JSON payload passed through untouched
//! - `/home` redirects to `/`

use std::time::Duration;

use bytes::Bytes;
use serde_json::json;

use trickle_core::{MetaTag, Script, Stylesheet, UnitError};
use trickle_render::{MemoryDataCache, PageDescriptor, RenderUnit};

use crate::routes::{Navigation, RequestContext, RouteTable};

const GREETING_KEY: &str = "/api/greeting";
const RECOMMENDATIONS_KEY: &str = "/api/recommendations";

pub fn routes() -> RouteTable {
    RouteTable::new()
        .page("/", |ctx| Navigation::Page(home(ctx)))
        .page("/fragment", |ctx| Navigation::Page(fragment(ctx)))
        .page("/raw", |_| Navigation::Page(raw()))
        .redirect("/home", 301, "/")
}

fn delayed(name: &str, delay: Duration, html: String) -> RenderUnit {
    RenderUnit::new(name, async move {
        tokio::time::sleep(delay).await;
        Ok(html)
    })
}

/// A unit rendered from the greeting fetch once it resolves.
fn greeting(cache: &MemoryDataCache) -> RenderUnit {
    let ready = cache.get(GREETING_KEY);
    RenderUnit::new("greeting", async move {
        let data = ready.await.map_err(|e| UnitError::Failed(e.to_string()))?;
        let name = data["name"].as_str().unwrap_or("stranger");
        Ok(format!("<p class='greeting'>Hello, {name}!</p>"))
    })
}

fn units(ctx: &RequestContext) -> Vec<RenderUnit> {
    ctx.cache.fetch(GREETING_KEY, async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok(json!({ "name": "trickle" }))
    });
    vec![
        delayed(
            "header",
            Duration::from_millis(5),
            "<header><h1>trickle</h1></header>".to_string(),
        ),
        greeting(&ctx.cache),
        delayed(
            "feed",
            Duration::from_millis(250),
            "<ul class='feed'><li>first</li><li>second</li></ul>".to_string(),
        ),
        delayed(
            "footer",
            Duration::from_millis(10),
            "<footer>streamed in order</footer>".to_string(),
        ),
    ]
}

fn home(ctx: &RequestContext) -> PageDescriptor {
    let mut page = PageDescriptor::page("home")
        .with_title("trickle demo")
        .with_stylesheet(Stylesheet::inline("body{font-family:sans-serif}"))
        .with_script(Script::inline("console.log('page scripts running')"))
        .with_meta_tags(vec![
            MetaTag::charset("utf-8"),
            MetaTag::named("description", "Ordered streaming render demo"),
        ])
        .with_body_classes(vec!["demo".to_string()])
        .with_above_the_fold(2);
    for unit in units(ctx) {
        page = page.with_unit(unit);
    }

    // Nothing on the page waits for this one; it reaches the client as a
    // late arrival.
    ctx.cache.fetch(RECOMMENDATIONS_KEY, async {
        tokio::time::sleep(Duration::from_millis(600)).await;
        Ok(json!({ "items": ["streams", "futures", "channels"] }))
    });
    page
}

fn fragment(ctx: &RequestContext) -> PageDescriptor {
    let mut page = PageDescriptor::fragment("fragment");
    for unit in units(ctx) {
        page = page.with_unit(unit);
    }
    page
}

fn raw() -> PageDescriptor {
    let mut page = PageDescriptor::raw("raw").with_response_data(async {
        let body = json!({ "ok": true, "source": "trickle" }).to_string();
        Ok(Some(Bytes::from(body)))
    });
    page.content_type = "application/json".to_string();
    page
}
