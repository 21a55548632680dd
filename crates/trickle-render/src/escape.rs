//! String escaping for attribute values and inline script payloads.

/// Escape a value for use inside a double-quoted HTML attribute.
pub fn attr(value: &str) -> String {
    value.replace('"', "&quot;")
}

/// Make serialized JSON safe to embed inside a `<script>` element.
///
/// `<` is escaped so that neither `</script>` nor `<!--` can appear in
/// the payload, and the two JavaScript line terminators that are legal in
/// JSON strings are escaped as well.
pub fn for_script_tag(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for ch in json.chars() {
        match ch {
            '<' => out.push_str("\\u003c"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            other => out.push(other),
        }
    }
    out
}

/// Serialize `value` to JSON and escape it for a `<script>` element.
pub fn json_for_script(value: &serde_json::Value) -> String {
    for_script_tag(&value.to_string())
}
