//! Endpoint normalization against the configured base URL.

use reqwest::Url;
use serde_json::{Map, Value};

use super::ApiError;

/// Join `endpoint` onto `base` with exactly one `/` between them.
///
/// Leading slashes on the endpoint and trailing slashes on the base are
/// ignored, so `"x"`, `"/x"` and `"//x"` resolve alike. Absolute `http(s)`
/// URLs pass through unchanged.
pub fn resolve(base: &str, endpoint: &str) -> String {
    if is_absolute(endpoint) {
        return endpoint.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

fn is_absolute(endpoint: &str) -> bool {
    let lower = endpoint.get(..8).unwrap_or(endpoint).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Resolves endpoints for one API base URL.
#[derive(Debug, Clone)]
pub struct EndpointResolver {
    base_url: String,
}

impl EndpointResolver {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn resolve(&self, endpoint: &str) -> String {
        resolve(&self.base_url, endpoint)
    }

    /// Resolve and append the non-empty query parameters.
    pub fn url(&self, endpoint: &str, params: &QueryParams) -> Result<Url, ApiError> {
        let resolved = self.resolve(endpoint);
        let mut url = Url::parse(&resolved).map_err(|e| {
            ApiError::InvalidRequest(format!("invalid request URL {}: {}", resolved, e))
        })?;

        let pairs = params.pairs();
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }
        Ok(url)
    }
}

// ============================================================================
// Query parameters
// ============================================================================

/// Ordered query parameters.
///
/// Null values and empty strings are dropped when serialized, so optional
/// filters can be passed straight through without sending `null`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams {
    entries: Vec<(String, Value)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.pairs().is_empty()
    }

    /// The key/value pairs that will actually be sent.
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter_map(|(key, value)| {
                let rendered = match value {
                    Value::Null => return None,
                    Value::String(s) if s.is_empty() => return None,
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Some((key.clone(), rendered))
            })
            .collect()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = QueryParams::new();
        for (key, value) in iter {
            params.insert(key, value);
        }
        params
    }
}

impl From<Map<String, Value>> for QueryParams {
    fn from(map: Map<String, Value>) -> Self {
        map.into_iter().collect()
    }
}
