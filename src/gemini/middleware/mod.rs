//! Request filters that run before any handler. Each middleware either
//! lets the request through or supplies the rejection response; the
//! pipeline short-circuits on the first rejection.

use std::sync::Arc;

use crate::gemini::response::Response;
use crate::gemini::Request;

pub mod access;
pub mod certauth;
pub mod ratelimit;

pub use access::AccessControl;
pub use certauth::CertAuth;
pub use ratelimit::RateLimiter;

#[derive(Debug)]
pub enum Verdict {
    Allow,
    Reject(Response),
}

pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;
    fn process(&self, request: &Request) -> Verdict;
}

#[derive(Default, Clone)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Pipeline {
        Pipeline::default()
    }

    pub fn push(&mut self, stage: Arc<dyn Middleware>) {
        self.stages.push(stage);
    }

    /// Run all stages in order. `Some(response)` means a stage rejected
    /// the request and later stages never saw it.
    pub fn run(&self, request: &Request) -> Option<(&'static str, Response)> {
        for stage in &self.stages {
            if let Verdict::Reject(response) = stage.process(request) {
                return Some((stage.name(), response));
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
