// src/cache/mod.rs
mod single_flight;

pub use single_flight::{CacheError, SingleFlight};

use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::StatusCode;

use crate::rules::ResponseSink;

pub const X_CACHE_HIT: &str = "x-cache-hit";

/// A response captured once and replayed verbatim afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CachedResponse {
    /// Freezes whatever the wrapped chain wrote, marked as a cache hit.
    pub fn capture(sink: ResponseSink) -> Self {
        let (status, mut headers, body) = sink.into_parts();
        headers.insert(X_CACHE_HIT, HeaderValue::from_static("HIT"));
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn replay(&self, res: &mut ResponseSink) {
        res.replace_headers(&self.headers);
        res.set_status(self.status);
        res.write(&self.body);
    }
}
