//! Cache keys and stored entries.

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use nutrisync_net::{NetError, Request, Response};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;
use url::Url;

/// Identity of a cached request: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: Method,
    url: Url,
}

impl CacheKey {
    pub fn new(method: Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self { method, url }
    }

    /// Key of a `GET` for `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn for_request(request: &Request) -> Self {
        Self::new(request.method.clone(), &request.url)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A cached request/response pair.
///
/// Entries are immutable snapshots. Every lookup builds a fresh [`Response`]
/// from the stored bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request method.
    pub method: String,

    /// Request URL.
    pub url: Url,

    /// Response status.
    pub status: u16,

    /// Response headers in arrival order.
    pub headers: Vec<StoredHeader>,

    /// Response body.
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response, consuming its body.
    pub async fn capture(key: &CacheKey, response: Response) -> Result<Self, NetError> {
        let status = response.status.as_u16();
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| StoredHeader {
                name: name.as_str().to_string(),
                value: value.as_bytes().to_vec(),
            })
            .collect();
        let body = response.bytes().await?;

        Ok(Self {
            method: key.method().to_string(),
            url: key.url().clone(),
            status,
            headers,
            body: body.to_vec(),
            cached_at: nutrisync_common::unix_millis(),
        })
    }

    /// Materialize a new response from this snapshot.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::new();
        for header in &self.headers {
            match (
                HeaderName::try_from(header.name.as_str()),
                HeaderValue::from_bytes(&header.value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => trace!(header = %header.name, url = %self.url, "Dropping unreadable stored header"),
            }
        }

        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        Response::new(
            self.url.clone(),
            status,
            headers,
            Bytes::from(self.body.clone()),
        )
    }
}

/// One response header. The value is kept as raw bytes, since header values
/// need not be UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHeader {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
}

impl StoredHeader {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
