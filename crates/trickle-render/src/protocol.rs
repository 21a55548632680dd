//! Client-side protocol: global names and notification payloads.
//!
//! The client runtime defines these globals; the server only ever emits
//! calls to them through the script sequencer.

use std::fmt::Write as _;

use serde_json::Value;
use trickle_core::Script;

use crate::escape;

/// Attribute carrying a unit's index on its wrapper element.
pub const ROOT_ID_ATTR: &str = "data-trickle-root-id";
/// Attribute carrying a unit's emission offset in milliseconds.
pub const TIMING_OFFSET_ATTR: &str = "data-trickle-timing-offset";
/// Marker attribute on the content container element.
pub const CONTENT_NODE_ATTR: &str = "data-trickle-content";
/// Marker attribute on head stylesheets.
pub const CSS_NODE_ATTR: &str = "data-trickle-css";
/// Marker attribute on head link tags.
pub const LINK_NODE_ATTR: &str = "data-trickle-link";

/// Client-side timing origin, written synchronously into the head.
pub fn timing_start() -> Script {
    Script::inline("__trickleTimingStart=new Date")
}

/// Tell the client unit `index` is in the DOM.
pub fn node_arrival(index: usize) -> Script {
    Script::inline(format!("__trickleNodeArrival({index})"))
}

/// Tell the client no further units will arrive.
pub fn fail_arrival() -> Script {
    Script::inline("__trickleFailArrival()")
}

/// Hand a late data fetch to the client cache.
pub fn data_arrival(key: &str, payload: &Value) -> Script {
    let key = Value::String(key.to_string());
    Script::inline(format!(
        "__trickleDataArrival({}, {});",
        escape::json_for_script(&key),
        escape::json_for_script(payload)
    ))
}

/// Expose the initial state and start the client.
pub fn bootstrap(data_cache: Value, config: Value) -> Script {
    let state = serde_json::json!({
        "InitialContext": { "DataCache": data_cache },
        "Config": config,
    });
    let mut text = String::new();
    let _ = write!(
        text,
        "window.__trickleState={};trickleBootstrap();",
        escape::json_for_script(&state)
    );
    Script::inline(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn data_arrival_escapes_payload() {
        let script = data_arrival("/api/x", &json!({ "html": "</script>" }));
        let text = script.text.unwrap();
        assert!(text.starts_with(r#"__trickleDataArrival("/api/x", {"#));
        assert!(!text.contains("</script>"));
    }

    #[test]
    fn bootstrap_payload_shape() {
        let script = bootstrap(json!({ "k": { "status": "pending" } }), json!({ "a": 1 }));
        let text = script.text.unwrap();
        assert!(text.starts_with("window.__trickleState={"));
        assert!(text.ends_with(";trickleBootstrap();"));
        assert!(text.contains(r#""Config":{"a":1}"#));
        assert!(text.contains(r#""DataCache":{"k":{"status":"pending"}}"#));
    }

    #[test]
    fn node_arrival_text() {
        assert_eq!(node_arrival(4).text.as_deref(), Some("__trickleNodeArrival(4)"));
    }
}
