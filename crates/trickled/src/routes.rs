//! Route table: maps request paths to page factories.
//!
//! Navigation is resolved before the render pipeline runs, so not-found
//! and redirect responses never reach it.

use std::collections::HashMap;
use std::sync::Arc;

use trickle_render::{MemoryDataCache, PageDescriptor};

/// What a request resolved to.
pub enum Navigation {
    Page(PageDescriptor),
    NotFound,
    Redirect { status: u16, location: String },
}

impl std::fmt::Debug for Navigation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Navigation::Page(page) => f
                .debug_tuple("Page")
                .field(&page.route_name)
                .finish(),
            Navigation::NotFound => f.write_str("NotFound"),
            Navigation::Redirect { status, location } => f
                .debug_struct("Redirect")
                .field("status", status)
                .field("location", location)
                .finish(),
        }
    }
}

/// Request data handed to a page factory.
pub struct RequestContext {
    pub path: String,
    pub query: Option<String>,
    /// Fetches started while building the page land here.
    pub cache: MemoryDataCache,
}

pub type PageFactory = Arc<dyn Fn(&RequestContext) -> Navigation + Send + Sync>;

#[derive(Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, PageFactory>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` for an exact `path`.
    pub fn page(
        mut self,
        path: &str,
        factory: impl Fn(&RequestContext) -> Navigation + Send + Sync + 'static,
    ) -> Self {
        self.routes.insert(path.to_string(), Arc::new(factory));
        self
    }

    pub fn redirect(self, path: &str, status: u16, location: &str) -> Self {
        let location = location.to_string();
        self.page(path, move |_| Navigation::Redirect {
            status,
            location: location.clone(),
        })
    }

    pub fn resolve(&self, ctx: &RequestContext) -> Navigation {
        match self.routes.get(&ctx.path) {
            Some(factory) => factory(ctx),
            None => Navigation::NotFound,
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
