//! Per-connection metadata.
//!
//! # Responsibilities
//! - Describe one connection: kind, method, path, headers, query, addresses
//! - Carry an extension slot interceptors use to hand data inward
//! - Provide ordered, duplicate-preserving header and query views
//!
//! # Design Decisions
//! - Header names are lowercased on insertion; values are raw bytes
//! - The context is cloned, not shared, between stages: an interceptor that
//!   rewrites it only affects the stages inside it
//! - The connection ID is the key for "current request" lookups, so it
//!   survives every clone

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::http::{Extensions, Method};
use bytes::Bytes;

use crate::net::ConnectionId;

/// The three connection kinds the engine speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Startup/shutdown channel.
    Lifespan,
    /// Single request/response exchange.
    Http,
    /// Bidirectional message stream.
    WebSocket,
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionKind::Lifespan => "lifespan",
            ConnectionKind::Http => "http",
            ConnectionKind::WebSocket => "websocket",
        };
        f.write_str(name)
    }
}

/// Ordered list of `(name, value)` header pairs. Duplicate names are allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    pairs: Vec<(Bytes, Bytes)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping any existing values for the same name.
    pub fn append(&mut self, name: impl AsRef<[u8]>, value: impl Into<Bytes>) {
        let name = Bytes::from(name.as_ref().to_ascii_lowercase());
        self.pairs.push((name, value.into()));
    }

    /// Replace every value for `name` with a single value.
    pub fn set(&mut self, name: impl AsRef<[u8]>, value: impl Into<Bytes>) {
        self.remove(name.as_ref());
        self.append(name, value);
    }

    /// Append only when no value exists for `name`.
    pub fn set_default(&mut self, name: impl AsRef<[u8]>, value: impl Into<Bytes>) {
        if !self.contains(name.as_ref()) {
            self.append(name, value);
        }
    }

    /// Remove every value for `name`.
    pub fn remove(&mut self, name: impl AsRef<[u8]>) {
        let name = name.as_ref();
        self.pairs.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn contains(&self, name: impl AsRef<[u8]>) -> bool {
        let name = name.as_ref();
        self.pairs.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// First value for `name` as raw bytes.
    pub fn get_bytes(&self, name: impl AsRef<[u8]>) -> Option<&Bytes> {
        let name = name.as_ref();
        self.pairs
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// First value for `name`, if it is valid UTF-8.
    pub fn get(&self, name: impl AsRef<[u8]>) -> Option<&str> {
        self.get_bytes(name)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Every UTF-8 value for `name`, in order.
    pub fn get_all(&self, name: impl AsRef<[u8]>) -> Vec<&str> {
        let name = name.as_ref();
        self.pairs
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .filter_map(|(_, v)| std::str::from_utf8(v).ok())
            .collect()
    }

    /// Number of values stored for `name`.
    pub fn count(&self, name: impl AsRef<[u8]>) -> usize {
        let name = name.as_ref();
        self.pairs
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .count()
    }

    pub fn extend(&mut self, other: HeaderList) {
        self.pairs.extend(other.pairs);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Bytes)> {
        self.pairs.iter().map(|(n, v)| (n, v))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl<N, V> FromIterator<(N, V)> for HeaderList
where
    N: AsRef<[u8]>,
    V: Into<Bytes>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut list = HeaderList::new();
        for (name, value) in iter {
            list.append(name, value);
        }
        list
    }
}

impl IntoIterator for HeaderList {
    type Item = (Bytes, Bytes);
    type IntoIter = std::vec::IntoIter<(Bytes, Bytes)>;

    fn into_iter(self) -> Self::IntoIter {
        self.pairs.into_iter()
    }
}

/// Parsed query string with duplicate-key support.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    /// Parse a raw `a=1&b=2&a=3` query string.
    pub fn parse(raw: &[u8]) -> Self {
        let pairs = url::form_urlencoded::parse(raw)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Self { pairs }
    }

    /// First value for `key`.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `key`, in order of appearance.
    pub fn all(&self, key: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Group values by key. Used when a handler wants keyword-style access.
    pub fn to_multimap(&self) -> HashMap<String, Vec<String>> {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for (k, v) in &self.pairs {
            map.entry(k.clone()).or_default().push(v.clone());
        }
        map
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Authorization tags attached to a connection by an auth interceptor.
///
/// Read by the dispatcher and handed to the router; an absent value means
/// "anonymous".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthTags {
    /// Identity the tags were granted to, for logging.
    pub principal: Option<String>,
    pub tags: Vec<String>,
}

/// Immutable description of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub kind: ConnectionKind,
    pub id: ConnectionId,
    pub method: Method,
    pub scheme: String,
    pub path: String,
    pub query_string: Bytes,
    pub headers: HeaderList,
    pub client: Option<SocketAddr>,
    pub server: Option<SocketAddr>,
    /// Per-connection slot for values interceptors pass inward.
    pub extensions: Extensions,
}

impl ConnectionContext {
    fn new(kind: ConnectionKind, method: Method, path: &str) -> Self {
        Self {
            kind,
            id: ConnectionId::new(),
            method,
            scheme: match kind {
                ConnectionKind::WebSocket => "ws".to_string(),
                _ => "http".to_string(),
            },
            path: path.to_string(),
            query_string: Bytes::new(),
            headers: HeaderList::new(),
            client: None,
            server: None,
            extensions: Extensions::new(),
        }
    }

    /// Context for a request/response exchange.
    pub fn http(method: Method, path: &str) -> Self {
        Self::new(ConnectionKind::Http, method, path)
    }

    /// Context for a bidirectional stream.
    pub fn websocket(path: &str) -> Self {
        Self::new(ConnectionKind::WebSocket, Method::GET, path)
    }

    /// Context for the lifecycle channel.
    pub fn lifespan() -> Self {
        Self::new(ConnectionKind::Lifespan, Method::GET, "")
    }

    pub fn with_query(mut self, raw: impl Into<Bytes>) -> Self {
        self.query_string = raw.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<Bytes>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_client(mut self, addr: SocketAddr) -> Self {
        self.client = Some(addr);
        self
    }

    pub fn with_server(mut self, addr: SocketAddr) -> Self {
        self.server = Some(addr);
        self
    }

    /// First value of a request header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Parse the raw query string.
    pub fn query(&self) -> QueryParams {
        QueryParams::parse(&self.query_string)
    }

    /// Tags granted by the auth interceptor, empty when anonymous.
    pub fn auth_tags(&self) -> &[String] {
        self.extensions
            .get::<AuthTags>()
            .map(|t| t.tags.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }
}
