//! Page descriptor handed to the pipeline by navigation.
//!
//! The descriptor is plain data plus owned futures. Each lifecycle stage
//! takes the pieces it needs, so every future is awaited at most once.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use trickle_core::{
    BaseTag, DebugComment, LinkTag, MetaTag, PageKind, RenderError, Script, Stylesheet,
    UnitError,
};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Future resolving to a stage input, or to a descriptor error.
pub type PageFuture<T> = BoxFuture<Result<T, RenderError>>;

/// Hook invoked once the response has completed, on every path.
pub type CompletionHook = Box<dyn FnOnce(&ResponseStats) + Send + 'static>;

/// One content fragment, produced by an independent computation.
pub struct RenderUnit {
    name: String,
    source: BoxFuture<Result<String, UnitError>>,
}

impl RenderUnit {
    pub fn new(
        name: impl Into<String>,
        source: impl Future<Output = Result<String, UnitError>> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            source: Box::pin(source),
        }
    }

    /// A unit that is already rendered.
    pub fn ready(name: impl Into<String>, html: impl Into<String>) -> Self {
        let html = html.into();
        Self::new(name, async move { Ok(html) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn into_parts(self) -> (String, BoxFuture<Result<String, UnitError>>) {
        (self.name, self.source)
    }
}

impl std::fmt::Debug for RenderUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderUnit").field("name", &self.name).finish()
    }
}

/// Summary passed to the completion hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseStats {
    pub status: u16,
    pub failed: bool,
    pub total_ms: u64,
    pub bytes_written: u64,
    pub late_arrivals: usize,
}

/// Everything the lifecycle needs to render one page.
pub struct PageDescriptor {
    pub kind: PageKind,
    pub status: u16,
    pub content_type: String,
    pub route_name: String,
    pub debug_comments: Vec<DebugComment>,
    pub title: Option<PageFuture<String>>,
    pub stylesheets: Vec<Stylesheet>,
    pub system_scripts: Vec<Script>,
    pub scripts: Vec<Script>,
    pub meta_tags: Vec<PageFuture<Vec<MetaTag>>>,
    pub link_tags: Vec<PageFuture<Vec<LinkTag>>>,
    pub base_tag: Option<PageFuture<Option<BaseTag>>>,
    pub body_classes: Option<PageFuture<Vec<String>>>,
    pub body_start_content: Option<PageFuture<Vec<String>>>,
    pub units: Vec<RenderUnit>,
    pub above_the_fold: usize,
    pub response_data: Option<PageFuture<Option<Bytes>>>,
    pub on_complete: Option<CompletionHook>,
}

impl PageDescriptor {
    pub fn new(kind: PageKind, route_name: impl Into<String>) -> Self {
        let content_type = match kind {
            PageKind::Raw => "application/octet-stream",
            PageKind::Page | PageKind::Fragment => "text/html; charset=utf-8",
        };
        Self {
            kind,
            status: 200,
            content_type: content_type.to_string(),
            route_name: route_name.into(),
            debug_comments: Vec::new(),
            title: None,
            stylesheets: Vec::new(),
            system_scripts: Vec::new(),
            scripts: Vec::new(),
            meta_tags: Vec::new(),
            link_tags: Vec::new(),
            base_tag: None,
            body_classes: None,
            body_start_content: None,
            units: Vec::new(),
            above_the_fold: 1,
            response_data: None,
            on_complete: None,
        }
    }

    pub fn page(route_name: impl Into<String>) -> Self {
        Self::new(PageKind::Page, route_name)
    }

    pub fn fragment(route_name: impl Into<String>) -> Self {
        Self::new(PageKind::Fragment, route_name)
    }

    pub fn raw(route_name: impl Into<String>) -> Self {
        Self::new(PageKind::Raw, route_name)
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        let title = title.into();
        self.title = Some(Box::pin(async move { Ok(title) }));
        self
    }

    pub fn with_unit(mut self, unit: RenderUnit) -> Self {
        self.units.push(unit);
        self
    }

    pub fn with_above_the_fold(mut self, count: usize) -> Self {
        self.above_the_fold = count;
        self
    }

    pub fn with_script(mut self, script: Script) -> Self {
        self.scripts.push(script);
        self
    }

    pub fn with_stylesheet(mut self, stylesheet: Stylesheet) -> Self {
        self.stylesheets.push(stylesheet);
        self
    }

    pub fn with_meta_tags(mut self, tags: Vec<MetaTag>) -> Self {
        self.meta_tags.push(Box::pin(async move { Ok(tags) }));
        self
    }

    pub fn with_link_tags(mut self, tags: Vec<LinkTag>) -> Self {
        self.link_tags.push(Box::pin(async move { Ok(tags) }));
        self
    }

    pub fn with_base_tag(mut self, base: BaseTag) -> Self {
        self.base_tag = Some(Box::pin(async move { Ok(Some(base)) }));
        self
    }

    pub fn with_body_classes(mut self, classes: Vec<String>) -> Self {
        self.body_classes = Some(Box::pin(async move { Ok(classes) }));
        self
    }

    pub fn with_response_data(
        mut self,
        data: impl Future<Output = Result<Option<Bytes>, RenderError>> + Send + 'static,
    ) -> Self {
        self.response_data = Some(Box::pin(data));
        self
    }

    pub fn on_complete(mut self, hook: impl FnOnce(&ResponseStats) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(hook));
        self
    }

    /// Above-the-fold count clamped to at least one.
    pub fn above_the_fold_count(&self) -> usize {
        self.above_the_fold.max(1)
    }
}
