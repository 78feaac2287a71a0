//! Cached request and response views handed to policy callbacks.

use std::borrow::Cow;
use std::collections::HashMap;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::protocol::{RequestHeadersEvent, RequestMetadata};

/// An in-flight HTTP request as seen by the agent.
///
/// Built from the request-headers event and enriched with the accumulated
/// body once the final chunk has arrived. The embedded cancellation token
/// fires when the proxy cancels the request; long-running callbacks should
/// observe it.
#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    uri: String,
    headers: HashMap<String, Vec<String>>,
    metadata: RequestMetadata,
    body: Option<Bytes>,
    cancel: CancellationToken,
}

impl Request {
    pub(crate) fn from_event(event: RequestHeadersEvent, cancel: CancellationToken) -> Self {
        Self {
            method: event.method,
            uri: event.uri,
            headers: event.headers,
            metadata: event.metadata,
            body: None,
            cancel,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The path component of the URI, without the query string.
    pub fn path(&self) -> &str {
        match self.uri.split_once('?') {
            Some((path, _)) => path,
            None => &self.uri,
        }
    }

    /// The query string, if any.
    pub fn query(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, q)| q)
    }

    pub fn path_starts_with(&self, prefix: &str) -> bool {
        self.path().starts_with(prefix)
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// All values of a header, matched case-insensitively.
    pub fn header_values(&self, name: &str) -> Option<&[String]> {
        if let Some(values) = self.headers.get(name) {
            return Some(values);
        }
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    pub fn headers(&self) -> &HashMap<String, Vec<String>> {
        &self.headers
    }

    pub fn metadata(&self) -> &RequestMetadata {
        &self.metadata
    }

    pub fn correlation_id(&self) -> &str {
        &self.metadata.correlation_id
    }

    pub fn client_ip(&self) -> &str {
        &self.metadata.client_ip
    }

    /// The accumulated request body, present in body callbacks.
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// The body decoded as UTF-8, lossily.
    pub fn body_string(&self) -> Option<Cow<'_, str>> {
        self.body.as_ref().map(|b| String::from_utf8_lossy(b))
    }

    /// Token that fires when the proxy cancels this request.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn with_body(&self, body: Bytes) -> Self {
        let mut cloned = self.clone();
        cloned.body = Some(body);
        cloned
    }
}

/// An upstream response as seen by the agent.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: HashMap<String, Vec<String>>,
    body: Option<Bytes>,
}

impl Response {
    pub(crate) fn new(status: u16, headers: HashMap<String, Vec<String>>) -> Self {
        Self {
            status,
            headers,
            body: None,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        if let Some(values) = self.headers.get(name) {
            return values.first().map(String::as_str);
        }
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.first())
            .map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, Vec<String>> {
        &self.headers
    }

    /// The accumulated response body, present in body callbacks.
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn body_string(&self) -> Option<Cow<'_, str>> {
        self.body.as_ref().map(|b| String::from_utf8_lossy(b))
    }

    pub(crate) fn with_body(&self, body: Bytes) -> Self {
        let mut cloned = self.clone();
        cloned.body = Some(body);
        cloned
    }
}
