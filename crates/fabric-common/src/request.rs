//! The request envelope threaded through one or more executions.
//!
//! A [`CoordinatedRequest`] is built from the inbound HTTP request, bound to
//! an instance for the duration of a call, and carried from step to step by
//! the sequencer, which accumulates step outputs in [`CoordinatedRequest::state`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Response headers set by guests, in insertion order per name.
///
/// Setting a header appends a value; nothing is deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseHeaders(BTreeMap<String, Vec<String>>);

impl ResponseHeaders {
    /// Create an empty header set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value under `name`.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.entry(name.into()).or_default().push(value.into());
    }

    /// All values recorded under `name`, in the order they were set.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.0.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    /// Append every value of `other` to this set.
    pub fn merge(&mut self, other: &ResponseHeaders) {
        for (name, values) in &other.0 {
            self.0
                .entry(name.clone())
                .or_default()
                .extend(values.iter().cloned());
        }
    }

    /// Iterate over `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// Returns `true` if any value is recorded under `name` (case-insensitive).
    pub fn contains(&self, name: &str) -> bool {
        self.0.keys().any(|k| k.eq_ignore_ascii_case(name))
    }

    /// Returns `true` if no header was set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The request envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatedRequest {
    /// HTTP method of the inbound request.
    pub method: String,
    /// URL (path and query) of the inbound request.
    pub url: String,
    /// Unique request identifier.
    pub id: String,
    /// Request body passed to the guest.
    #[serde(with = "crate::b64", default)]
    pub body: Vec<u8>,
    /// Inbound request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Response headers set by guests.
    #[serde(default)]
    pub resp_headers: ResponseHeaders,
    /// URL path parameters.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Running state map threaded through a sequence.
    #[serde(with = "crate::b64::map", default)]
    pub state: BTreeMap<String, Vec<u8>>,
    /// Remaining steps of a sequence, as JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_json: Option<String>,
}

impl CoordinatedRequest {
    /// Create a new request with a fresh identifier.
    pub fn new(method: impl Into<String>, url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            id: Uuid::new_v4().to_string(),
            body,
            ..Default::default()
        }
    }

    /// Get a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set a header, replacing any value stored under a case-insensitive match.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
        self.headers.insert(name.to_string(), value.into());
    }

    /// Get a query-string parameter from the request URL.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let (_, query) = self.url.split_once('?')?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Read a top-level field of a JSON body.
    ///
    /// String values are returned without quotes; every other JSON value is
    /// returned as its JSON text.
    pub fn body_field(&self, key: &str) -> Option<Vec<u8>> {
        let value: serde_json::Value = serde_json::from_slice(&self.body).ok()?;
        match value.get(key)? {
            serde_json::Value::String(s) => Some(s.clone().into_bytes()),
            other => Some(other.to_string().into_bytes()),
        }
    }

    /// Set a top-level field of a JSON body, creating an object if the body
    /// is empty.
    ///
    /// Returns `false` if the body is neither empty nor a JSON object.
    pub fn set_body_field(&mut self, key: &str, value: &[u8]) -> bool {
        let mut object = if self.body.is_empty() {
            serde_json::Map::new()
        } else {
            match serde_json::from_slice::<serde_json::Value>(&self.body) {
                Ok(serde_json::Value::Object(map)) => map,
                _ => return false,
            }
        };

        let value = serde_json::from_slice(value).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(value).into_owned())
        });
        object.insert(key.to_string(), value);

        match serde_json::to_vec(&serde_json::Value::Object(object)) {
            Ok(body) => {
                self.body = body;
                true
            }
            Err(_) => false,
        }
    }
}
