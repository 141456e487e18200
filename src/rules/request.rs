// src/rules/request.rs
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use hyper::{Body, Method, Response, StatusCode, Uri, Version};
use std::net::SocketAddr;
use tokio::time::Instant;

/// A fully buffered inbound request as seen by the rule chain.
///
/// The body is read once at the edge so that every node in a chain (and the
/// cache population task) can replay it.
#[derive(Debug, Clone)]
pub struct RuleRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: Option<SocketAddr>,
    pub scheme: String,
    pub deadline: Option<Instant>,
}

impl RuleRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: None,
            scheme: "http".to_string(),
            deadline: None,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Host as sent by the caller, falling back to the request-target authority.
    pub fn host(&self) -> &str {
        self.headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| self.uri.authority().map(|a| a.as_str()))
            .unwrap_or("")
    }

    /// Canonical identity used for route matching: `scheme://host/path`.
    pub fn identity(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host(), self.uri.path())
    }
}

/// Response under construction while a chain executes.
///
/// Nodes write into the sink in order; headers set by a later node replace
/// those of the same name, body writes append.
#[derive(Debug, Clone, Default)]
pub struct ResponseSink {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl ResponseSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink preloaded with headers that every response carries.
    pub fn with_headers(headers: HeaderMap) -> Self {
        Self {
            headers,
            ..Self::default()
        }
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    /// Status written so far; 200 when nothing set one explicitly.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Replaces every value of each header name present in `headers`.
    pub fn replace_headers(&mut self, headers: &HeaderMap) {
        for name in headers.keys() {
            self.headers.remove(name);
            for value in headers.get_all(name) {
                self.headers.append(name.clone(), value.clone());
            }
        }
    }

    pub fn write(&mut self, chunk: &[u8]) {
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        self.body.extend_from_slice(chunk);
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_parts(self) -> (StatusCode, HeaderMap, Bytes) {
        let status = self.status.unwrap_or(StatusCode::OK);
        (status, self.headers, Bytes::from(self.body))
    }

    pub fn into_response(self) -> Response<Body> {
        let (status, headers, body) = self.into_parts();
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_uses_host_header() {
        let req = RuleRequest::new(Method::GET, "/api/v1?x=1".parse().unwrap())
            .with_header(HOST, HeaderValue::from_static("example.test:9000"));
        assert_eq!(req.identity(), "http://example.test:9000/api/v1");
    }

    #[test]
    fn later_headers_replace_earlier_ones() {
        let mut sink = ResponseSink::new();
        sink.headers_mut()
            .append("x-a", HeaderValue::from_static("1"));
        sink.headers_mut()
            .append("x-a", HeaderValue::from_static("2"));

        let mut next = HeaderMap::new();
        next.insert("x-a", HeaderValue::from_static("3"));
        sink.replace_headers(&next);

        let values: Vec<_> = sink.headers().get_all("x-a").iter().collect();
        assert_eq!(values, vec![&HeaderValue::from_static("3")]);
    }

    #[test]
    fn write_defaults_status_to_ok() {
        let mut sink = ResponseSink::new();
        sink.write(b"hello ");
        sink.write(b"world");
        let (status, _, body) = sink.into_parts();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"hello world");
    }
}
