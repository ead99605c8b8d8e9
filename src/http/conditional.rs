//! Conditional request evaluation (`If-None-Match`, `If-Modified-Since`).

use crate::http::response::parse_http_date;
use crate::protocol::HeaderList;

/// Headers a 304 keeps from the full response.
const NOT_MODIFIED_KEEP: &[&str] = &[
    "cache-control",
    "content-location",
    "date",
    "etag",
    "expires",
    "vary",
    "last-modified",
];

/// Strip the weak prefix for comparison.
fn opaque(tag: &str) -> &str {
    let tag = tag.trim();
    tag.strip_prefix("W/").unwrap_or(tag)
}

/// True if an `If-None-Match` value matches `etag` (weak comparison).
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let etag = opaque(etag);
    if_none_match
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || opaque(candidate) == etag)
}

/// Decide whether the client's cached copy is still current.
///
/// `If-None-Match` takes precedence; `If-Modified-Since` is only consulted
/// when it is absent.
pub fn is_not_modified(request_headers: &HeaderList, response_headers: &HeaderList) -> bool {
    if let Some(if_none_match) = request_headers.get("if-none-match") {
        return match response_headers.get("etag") {
            Some(etag) => etag_matches(if_none_match, etag),
            None => false,
        };
    }

    let since = request_headers
        .get("if-modified-since")
        .and_then(parse_http_date);
    let modified = response_headers
        .get("last-modified")
        .and_then(parse_http_date);
    match (since, modified) {
        (Some(since), Some(modified)) => modified <= since,
        _ => false,
    }
}

/// Headers for a 304 derived from the full response's headers.
pub fn not_modified_headers(headers: &HeaderList) -> HeaderList {
    headers
        .iter()
        .filter(|(name, _)| {
            NOT_MODIFIED_KEEP
                .iter()
                .any(|keep| name.eq_ignore_ascii_case(keep.as_bytes()))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}
