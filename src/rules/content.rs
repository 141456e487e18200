// src/rules/content.rs
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, LOCATION};
use hyper::StatusCode;

use super::{ResponseSink, RuleNode, RuleRequest};
use crate::config::ConfigError;

/// Fixed response: status, headers and body never change after construction.
#[derive(Debug)]
pub struct ContentRule {
    body: Bytes,
    headers: HeaderMap,
    status: StatusCode,
    successor: Option<Box<RuleNode>>,
}

impl ContentRule {
    /// Plain `200 OK` with the given body.
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            body: content.into(),
            headers: HeaderMap::new(),
            status: StatusCode::OK,
            successor: None,
        }
    }

    /// Content with explicit status and `"Name: value"` header lines.
    pub fn complete(
        content: impl Into<Bytes>,
        headers: &[String],
        status: u16,
    ) -> Result<Self, ConfigError> {
        let status = StatusCode::from_u16(status).map_err(|_| ConfigError::InvalidDescriptor {
            path: "content".to_string(),
            reason: format!("{} is not a valid status", status),
        })?;

        Ok(Self {
            body: content.into(),
            headers: parse_header_lines(headers)?,
            status,
            successor: None,
        })
    }

    /// Redirect to `destination` with a 3xx status.
    pub fn redirect(destination: &str, status: u16) -> Result<Self, ConfigError> {
        let status = StatusCode::from_u16(status)
            .ok()
            .filter(StatusCode::is_redirection)
            .ok_or_else(|| ConfigError::InvalidDescriptor {
                path: destination.to_string(),
                reason: format!("{} is not a redirect status", status),
            })?;
        let location = HeaderValue::from_str(destination)
            .map_err(|_| ConfigError::InvalidHeader(destination.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, location);

        Ok(Self {
            body: Bytes::from(format!("Content Moved HTTP {}", status.as_u16())),
            headers,
            status,
            successor: None,
        })
    }

    pub fn add_target_rule(&mut self, rule: RuleNode) {
        self.successor = Some(Box::new(rule));
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub async fn serve(&self, req: &RuleRequest, res: &mut ResponseSink) {
        res.replace_headers(&self.headers);
        res.set_status(self.status);
        res.write(&self.body);

        if let Some(next) = &self.successor {
            next.serve(req, res).await;
        }
    }
}

/// Parses `"Name: value"` lines into a header map, keeping repeated names.
pub fn parse_header_lines(lines: &[String]) -> Result<HeaderMap, ConfigError> {
    let mut headers = HeaderMap::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ConfigError::InvalidHeader(line.clone()))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| ConfigError::InvalidHeader(line.clone()))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| ConfigError::InvalidHeader(line.clone()))?;
        headers.append(name, value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Method;

    fn any_request() -> RuleRequest {
        RuleRequest::new(Method::GET, "/whatever".parse().unwrap())
    }

    #[tokio::test]
    async fn redirect_sets_location_and_status() {
        let rule = ContentRule::redirect("https://example.test", 301).unwrap();
        let mut sink = ResponseSink::new();
        rule.serve(&any_request(), &mut sink).await;

        assert_eq!(sink.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(sink.headers()[LOCATION], "https://example.test");
        assert_eq!(sink.body(), b"Content Moved HTTP 301");
    }

    #[test]
    fn redirect_requires_3xx() {
        assert!(ContentRule::redirect("https://example.test", 200).is_err());
    }

    #[tokio::test]
    async fn complete_content_carries_headers() {
        let rule = ContentRule::complete(
            "<h1>down</h1>",
            &["Content-Type: text/html".to_string(), "Retry-After: 30".to_string()],
            503,
        )
        .unwrap();
        let mut sink = ResponseSink::new();
        rule.serve(&any_request(), &mut sink).await;

        assert_eq!(sink.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(sink.headers()["content-type"], "text/html");
        assert_eq!(sink.headers()["retry-after"], "30");
    }

    #[test]
    fn header_lines_keep_value_colons() {
        let headers = parse_header_lines(&["Link: <https://a.test>; rel=next".to_string()]).unwrap();
        assert_eq!(headers["link"], "<https://a.test>; rel=next");
        assert!(parse_header_lines(&["missing-separator".to_string()]).is_err());
    }
}
