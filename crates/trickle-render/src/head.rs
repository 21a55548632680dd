//! Head tag rendering and validation.

use std::fmt::Write as _;

use tracing::warn;

use trickle_core::{BaseTag, DebugComment, LinkTag, MetaTag, RenderError, RenderResult, Stylesheet};

use crate::escape::attr;
use crate::protocol::{CSS_NODE_ATTR, LINK_NODE_ATTR};

pub fn debug_comments(comments: &[DebugComment]) -> String {
    let mut out = String::new();
    for comment in comments {
        if comment.label.is_empty() || comment.value.is_empty() {
            warn!(label = %comment.label, "debug comment is missing either a label or a value");
        }
        let _ = write!(out, "<!-- {}: {} -->", comment.label, comment.value);
    }
    out
}

pub fn title(title: &str) -> String {
    format!("<title>{title}</title>")
}

pub fn stylesheets(sheets: &[Stylesheet]) -> RenderResult<String> {
    let mut out = String::new();
    for sheet in sheets {
        let (style_type, media) = (&sheet.style_type, &sheet.media);
        if let Some(href) = &sheet.href {
            let _ = write!(
                out,
                r#"<link rel="stylesheet" type="{style_type}" media="{media}" href="{href}" {CSS_NODE_ATTR}>"#
            );
        } else if let Some(text) = &sheet.text {
            let _ = write!(
                out,
                r#"<style type="{style_type}" media="{media}" {CSS_NODE_ATTR}>{text}</style>"#
            );
        } else {
            return Err(RenderError::Stylesheet(
                "style has neither an href nor a text attribute".to_string(),
            ));
        }
    }
    Ok(out)
}

pub fn meta_tag(tag: &MetaTag) -> RenderResult<String> {
    let kinds = [&tag.name, &tag.http_equiv, &tag.charset]
        .iter()
        .filter(|v| v.is_some())
        .count();
    if kinds > 1 {
        return Err(RenderError::MalformedTag(
            "meta tag cannot have more than one of name, httpEquiv, and charset".to_string(),
        ));
    }
    if (tag.name.is_some() || tag.http_equiv.is_some()) && tag.content.is_none() {
        return Err(RenderError::MalformedTag(
            "meta tag has name or httpEquiv but does not have content".to_string(),
        ));
    }

    let mut out = String::new();
    if tag.noscript {
        out.push_str("<noscript>");
    }
    out.push_str("<meta");
    let attrs = [
        ("name", &tag.name),
        ("http-equiv", &tag.http_equiv),
        ("charset", &tag.charset),
        ("property", &tag.property),
        ("content", &tag.content),
    ];
    for (name, value) in attrs {
        if let Some(value) = value {
            let _ = write!(out, r#" {name}="{}""#, attr(value));
        }
    }
    out.push('>');
    if tag.noscript {
        out.push_str("</noscript>");
    }
    Ok(out)
}

pub fn link_tag(tag: &LinkTag) -> RenderResult<String> {
    if tag.get("rel").is_none() {
        return Err(RenderError::MalformedTag(
            "<link> tag specified without 'rel' attr".to_string(),
        ));
    }
    let attrs: Vec<String> = tag
        .attrs
        .iter()
        .map(|(name, value)| format!(r#"{name}="{}""#, attr(value)))
        .collect();
    Ok(format!("<link {LINK_NODE_ATTR} {}>", attrs.join(" ")))
}

pub fn base_tag(tag: &BaseTag) -> RenderResult<String> {
    if tag.href.is_none() && tag.target.is_none() {
        return Err(RenderError::MalformedTag(
            "<base> needs at least one of 'href' or 'target'".to_string(),
        ));
    }
    let mut out = String::from("<base");
    if let Some(href) = &tag.href {
        let _ = write!(out, r#" href="{}""#, attr(href));
    }
    if let Some(target) = &tag.target {
        let _ = write!(out, r#" target="{}""#, attr(target));
    }
    out.push('>');
    Ok(out)
}
