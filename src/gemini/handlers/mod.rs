//! Request handlers. A handler is a pure function of the parsed request
//! and its own configuration; errors never cross this boundary, they
//! become responses.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use path_clean::PathClean;

use crate::gemini::response::Response;
use crate::gemini::status::Status;
use crate::gemini::Request;

pub mod files;
pub mod titan;

pub use files::FileServer;
pub use titan::TitanHandler;

pub trait Handler: Send + Sync {
    fn handle(&self, request: &Request) -> Response;
}

/// Prefix-based dispatch. Routes are consulted in mount order and the
/// first matching prefix wins.
#[derive(Default, Clone)]
pub struct Router {
    routes: Vec<(String, Arc<dyn Handler>)>,
}

impl Router {
    pub fn new() -> Router {
        Router::default()
    }

    pub fn mount(&mut self, prefix: impl Into<String>, handler: Arc<dyn Handler>) {
        self.routes.push((prefix.into(), handler));
    }

    /// Mount with priority over everything registered so far.
    pub fn mount_front(&mut self, prefix: impl Into<String>, handler: Arc<dyn Handler>) {
        self.routes.insert(0, (prefix.into(), handler));
    }

    pub fn dispatch(&self, request: &Request) -> Response {
        for (prefix, handler) in &self.routes {
            if request.url.path.starts_with(prefix.as_str()) {
                return handler.handle(request);
            }
        }
        Response::new(Status::NotFound, "Not found")
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Join a request path onto `root` and resolve `.`/`..` lexically. `None`
/// means the result would land outside the root.
pub(crate) fn resolve_under_root(root: &Path, url_path: &str) -> Option<PathBuf> {
    let relative = url_path.trim_start_matches('/');
    let resolved = root.join(relative).clean();
    resolved.starts_with(root).then_some(resolved)
}
