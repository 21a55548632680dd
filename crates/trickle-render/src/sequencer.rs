//! Script sequencer: one ordered client-side execution chain per response.
//!
//! Script payloads are emitted in many separate `<script>` blocks over
//! the life of a response (head scripts, bootstrap, per-unit arrival
//! notifications, late data). Browsers do not guarantee that a mix of
//! async-loaded and inline scripts runs in document order, so every
//! block is written as an extension of a single named chain handle:
//!
//! ```text
//! batch 1:  <script>LOADER window._tChain=$trickleChain.script("a.js").wait(f1);</script>
//! batch 2:  <script>_tChain=_tChain.wait(f2);</script>
//! batch k:  <script>_tChain=_tChain.script("b.js").wait(fk);</script>
//! ```
//!
//! Each block only depends on the handle, and each block reassigns the
//! handle to its own tail, so batch *k+1* always runs after batch *k*.
//!
//! On the server the chain is a [`ChainToken`] value: [`enqueue`] takes
//! the token by value and returns the extended one, so there is exactly
//! one live tail per response.

use std::fmt::Write as _;

use thiserror::Error;
use trickle_core::{RenderError, RenderResult, Script};

use crate::escape;
use crate::sink::{GuardedSink, ResponseSink};

/// Name of the client-side variable holding the chain tail.
pub const CHAIN_HANDLE: &str = "_tChain";

/// Ordered script loader written ahead of the first async batch.
///
/// `script(src)` appends a fetch-and-execute step (a function returning
/// a falsy value skips it); `wait(fn)` appends an inline step. Steps run
/// strictly in the order they were appended.
pub const LOADER_PRELUDE: &str = concat!(
    "(function(w,d){",
    "function C(p){this.p=p}",
    "function L(o){return new Promise(function(r){",
    "var e=d.createElement(\"script\");e.src=o.src;",
    "if(o.crossOrigin)e.crossOrigin=o.crossOrigin;",
    "e.async=false;e.onload=e.onerror=function(){r()};",
    "(d.head||d.documentElement).appendChild(e)})}",
    "C.prototype.script=function(s){return new C(this.p.then(function(){",
    "var o=typeof s==\"function\"?s():s;if(!o)return;",
    "return L(typeof o==\"string\"?{src:o}:o)}))};",
    "C.prototype.wait=function(f){return new C(this.p.then(function(){if(f)f()}))};",
    "w.$trickleChain=new C(Promise.resolve())",
    "})(window,document);",
);

/// Tail of the script chain for one response. Not `Clone`: one live tail
/// per response.
#[derive(Debug, Default)]
pub struct ChainToken {
    batches: u64,
}

impl ChainToken {
    pub fn new() -> Self {
        Self { batches: 0 }
    }

    /// Whether the loader prelude has been written.
    pub fn is_started(&self) -> bool {
        self.batches > 0
    }

    /// Number of async batches appended so far.
    pub fn batches(&self) -> u64 {
        self.batches
    }
}

/// A rejected batch. Nothing was written and the chain tail is handed
/// back unchanged.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct EnqueueError {
    pub token: ChainToken,
    #[source]
    pub source: RenderError,
}

/// Append `scripts` to the chain and write the block that extends it.
///
/// If any payload has a non-JavaScript type the whole list is written
/// with [`render_sync`] instead and the token is returned untouched.
/// An empty list writes nothing.
pub fn enqueue<S: ResponseSink>(
    token: ChainToken,
    scripts: &[Script],
    sink: &mut GuardedSink<S>,
) -> Result<ChainToken, EnqueueError> {
    if scripts.is_empty() {
        return Ok(token);
    }
    if scripts.iter().any(|s| !s.is_javascript()) {
        return match render_sync(scripts, sink) {
            Ok(()) => Ok(token),
            Err(source) => Err(EnqueueError { token, source }),
        };
    }

    let block = match render_async_block(&token, scripts) {
        Ok(block) => block,
        Err(source) => return Err(EnqueueError { token, source }),
    };
    sink.write(block);
    Ok(ChainToken {
        batches: token.batches + 1,
    })
}

/// Write plain `<script>` tags, relying on document order.
/// All tags are validated before anything is written.
pub fn render_sync<S: ResponseSink>(
    scripts: &[Script],
    sink: &mut GuardedSink<S>,
) -> RenderResult<()> {
    let mut out = String::new();
    for script in scripts {
        let script_type = script.type_or_default();
        if let Some(href) = &script.href {
            let _ = write!(out, r#"<script src="{href}" type="{script_type}"></script>"#);
        } else if let Some(text) = &script.text {
            let _ = write!(out, r#"<script type="{script_type}">{text}</script>"#);
        } else {
            return Err(RenderError::Script(
                "script has neither an href nor a text attribute".to_string(),
            ));
        }
    }
    sink.write(out);
    Ok(())
}

fn render_async_block(token: &ChainToken, scripts: &[Script]) -> RenderResult<String> {
    let mut out = String::from("<script>");
    if token.is_started() {
        let _ = write!(out, "{CHAIN_HANDLE}={CHAIN_HANDLE}");
    } else {
        out.push_str(LOADER_PRELUDE);
        let _ = write!(out, "window.{CHAIN_HANDLE}=$trickleChain");
    }

    for script in scripts {
        if let Some(href) = &script.href {
            let target = match &script.cross_origin {
                Some(cross_origin) => serde_json::json!({
                    "src": href,
                    "crossOrigin": cross_origin,
                }),
                None => serde_json::Value::String(href.clone()),
            };
            let target = escape::json_for_script(&target);
            match &script.condition {
                Some(condition) => {
                    let _ = write!(
                        out,
                        ".script(function(){{if({condition}) return {target}}})"
                    );
                }
                None => {
                    let _ = write!(out, ".script({target})");
                }
            }
        } else if let Some(text) = &script.text {
            if script.condition.is_some() {
                return Err(RenderError::Script(
                    "inline script cannot be loaded conditionally".to_string(),
                ));
            }
            let strict = if script.strict { "\"use strict\";" } else { "" };
            let _ = write!(
                out,
                ".wait(function(){{{strict}try{{{text}}}catch(e){{setTimeout(function(){{throw(e)}},1)}}}}.bind(this))"
            );
        } else {
            return Err(RenderError::Script(
                "script needs either an href or a text".to_string(),
            ));
        }
    }

    out.push_str(";</script>");
    Ok(out)
}
