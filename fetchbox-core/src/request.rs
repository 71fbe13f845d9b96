//! Request descriptions.
//!
//! This module provides:
//!
//! - [`Method`] - the HTTP method of an operation
//! - [`RequestOptions`] - the caller-supplied request parts (headers, query,
//!   params, body)
//! - [`HeaderSource`] - headers as a static map or an async resolver
//!
//! Headers may be supplied as a plain map or as an async function; the
//! controller resolves them to a flat map before any middleware runs, so
//! plugins only ever see resolved headers.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

/// The HTTP method of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// HTTP GET.
    #[default]
    Get,
    /// HTTP POST.
    Post,
    /// HTTP PUT.
    Put,
    /// HTTP PATCH.
    Patch,
    /// HTTP DELETE.
    Delete,
}

impl Method {
    /// Returns the method as its canonical upper-case string.
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown method string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidMethod(String);

impl fmt::Display for InvalidMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid HTTP method: {}", self.0)
    }
}

impl std::error::Error for InvalidMethod {}

impl FromStr for Method {
    type Err = InvalidMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            other => Err(InvalidMethod(other.to_owned())),
        }
    }
}

/// A flat header map.
pub type HeaderMap = HashMap<String, String>;

type HeaderResolver = dyn Fn() -> BoxFuture<'static, HeaderMap> + Send + Sync;

/// Headers as a value or an async callback.
///
/// The callback form covers headers that must be computed per request, like
/// freshly minted auth tokens. Controllers always resolve the source to a
/// flat [`HeaderMap`] before middleware runs.
#[derive(Clone, Default)]
pub enum HeaderSource {
    /// No headers.
    #[default]
    Empty,
    /// A fixed header map.
    Static(HeaderMap),
    /// An async resolver invoked once per `execute`.
    Resolver(Arc<HeaderResolver>),
}

impl HeaderSource {
    /// Wraps an async resolver closure.
    pub fn resolver<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HeaderMap> + Send + 'static,
    {
        HeaderSource::Resolver(Arc::new(move || Box::pin(f())))
    }

    /// Resolves the source to a flat header map.
    pub async fn resolve(&self) -> HeaderMap {
        match self {
            HeaderSource::Empty => HeaderMap::new(),
            HeaderSource::Static(map) => map.clone(),
            HeaderSource::Resolver(f) => f().await,
        }
    }
}

impl fmt::Debug for HeaderSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderSource::Empty => f.write_str("HeaderSource::Empty"),
            HeaderSource::Static(map) => f.debug_tuple("HeaderSource::Static").field(map).finish(),
            HeaderSource::Resolver(_) => f.write_str("HeaderSource::Resolver(..)"),
        }
    }
}

impl From<HeaderMap> for HeaderSource {
    fn from(map: HeaderMap) -> Self {
        HeaderSource::Static(map)
    }
}

/// Caller-supplied request parts for one operation.
///
/// `query`, `params`, and `body` are dynamically shaped JSON values; they
/// participate in the canonical query key. Headers never do.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    /// Request headers, as a value or async resolver.
    pub headers: HeaderSource,
    /// Query-string parameters.
    pub query: Option<Value>,
    /// Path parameters substituted into `:param` placeholders.
    pub params: Option<Value>,
    /// Request body.
    pub body: Option<Value>,
    /// Transport-level cache mode hint, passed through verbatim.
    pub cache: Option<String>,
}

impl RequestOptions {
    /// Creates empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the query parameters.
    pub fn query(mut self, query: Value) -> Self {
        self.query = Some(query);
        self
    }

    /// Sets the path parameters.
    pub fn params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    /// Sets the request body.
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Sets the headers.
    pub fn headers(mut self, headers: impl Into<HeaderSource>) -> Self {
        self.headers = headers.into();
        self
    }

    /// Returns the serializable identity of these options for key building.
    ///
    /// Absent fields are omitted entirely so that `query: None` and a
    /// missing query produce the same key.
    pub fn key_payload(&self) -> Value {
        let mut payload = Map::new();
        if let Some(body) = &self.body {
            payload.insert("body".into(), body.clone());
        }
        if let Some(params) = &self.params {
            payload.insert("params".into(), params.clone());
        }
        if let Some(query) = &self.query {
            payload.insert("query".into(), query.clone());
        }
        Value::Object(payload)
    }

    /// Overlays `other` on top of `self`: fields present in `other` win.
    pub fn merged_with(&self, other: &RequestOptions) -> RequestOptions {
        RequestOptions {
            headers: match &other.headers {
                HeaderSource::Empty => self.headers.clone(),
                supplied => supplied.clone(),
            },
            query: other.query.clone().or_else(|| self.query.clone()),
            params: other.params.clone().or_else(|| self.params.clone()),
            body: other.body.clone().or_else(|| self.body.clone()),
            cache: other.cache.clone().or_else(|| self.cache.clone()),
        }
    }
}
