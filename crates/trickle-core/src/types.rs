//! Shared types used across trickle crates.

use serde::{Deserialize, Serialize};

/// MIME type assumed for scripts that do not declare one.
pub const DEFAULT_SCRIPT_TYPE: &str = "text/javascript";

/// Which lifecycle a page is rendered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    /// Full HTML document with head, body and client bootstrap.
    #[default]
    Page,
    /// Body units only, no document wrapper and no client scripts.
    Fragment,
    /// A single response-data payload written verbatim.
    Raw,
}

impl PageKind {
    pub fn label(&self) -> &'static str {
        match self {
            PageKind::Page => "page",
            PageKind::Fragment => "fragment",
            PageKind::Raw => "raw",
        }
    }
}

/// A script payload: either a reference to fetch or inline text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// MIME type; `None` means JavaScript.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub script_type: Option<String>,
    /// Client-side expression guarding a reference script.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_origin: Option<String>,
    #[serde(default)]
    pub strict: bool,
}

impl Script {
    pub fn href(href: impl Into<String>) -> Self {
        Self {
            href: Some(href.into()),
            ..Self::default()
        }
    }

    pub fn inline(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, script_type: impl Into<String>) -> Self {
        self.script_type = Some(script_type.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_cross_origin(mut self, cross_origin: impl Into<String>) -> Self {
        self.cross_origin = Some(cross_origin.into());
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn is_javascript(&self) -> bool {
        match self.script_type.as_deref() {
            None => true,
            Some(t) => t == DEFAULT_SCRIPT_TYPE,
        }
    }

    pub fn type_or_default(&self) -> &str {
        self.script_type.as_deref().unwrap_or(DEFAULT_SCRIPT_TYPE)
    }
}

/// A head stylesheet, linked or inline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stylesheet {
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default = "default_css_type", rename = "type")]
    pub style_type: String,
    #[serde(default = "default_media")]
    pub media: String,
}

impl Stylesheet {
    pub fn href(href: impl Into<String>) -> Self {
        Self {
            href: Some(href.into()),
            text: None,
            style_type: default_css_type(),
            media: default_media(),
        }
    }

    pub fn inline(text: impl Into<String>) -> Self {
        Self {
            href: None,
            text: Some(text.into()),
            style_type: default_css_type(),
            media: default_media(),
        }
    }
}

fn default_css_type() -> String {
    "text/css".to_string()
}

fn default_media() -> String {
    "all".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaTag {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub http_equiv: Option<String>,
    #[serde(default)]
    pub charset: Option<String>,
    #[serde(default)]
    pub property: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    /// Wrap the tag in `<noscript>`.
    #[serde(default)]
    pub noscript: bool,
}

impl MetaTag {
    pub fn named(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn charset(charset: impl Into<String>) -> Self {
        Self {
            charset: Some(charset.into()),
            ..Self::default()
        }
    }
}

/// A `<link>` tag. Attributes are kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkTag {
    pub attrs: Vec<(String, String)>,
}

impl LinkTag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((name.into(), value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseTag {
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
}

/// An HTML comment emitted at the top of the head, e.g. build info.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebugComment {
    pub label: String,
    pub value: String,
}
