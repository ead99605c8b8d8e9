//! Response model.
//!
//! # Responsibilities
//! - Build outbound responses from handler output and route metadata
//! - Choose framing: buffered (`Full`), streamed (`Stream`), or file-backed
//! - Inject `content-length` / `content-type` for buffered bodies
//! - Emit the `response-start` / `response-body` sequence
//!
//! # Design Decisions
//! - Headers are finalized at construction; `send` consumes the response,
//!   so a response is sent exactly once and never mutated afterwards
//! - Streamed bodies never get a `content-length`
//! - File reads go through `tokio::fs`, which runs them on the blocking pool

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use axum::http::StatusCode;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{BoxStream, StreamExt};
use serde::Serialize;
use tokio::io::AsyncReadExt;

use crate::dispatch::handler::HandlerOutput;
use crate::error::{EngineError, Result};
use crate::http::cookie::SetCookie;
use crate::protocol::{HeaderList, Outbound, OutboundMessage};
use crate::routing::RouteMetadata;

/// Lazily produced body chunks.
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// Default read size for file-backed bodies.
pub const DEFAULT_FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Where the body bytes come from.
pub enum Body {
    /// Fixed bytes with a known length.
    Full(Bytes),
    /// Lazy sequence of chunks of unknown total length.
    Stream(BodyStream),
    /// Sequential reads from a file.
    File { path: PathBuf, chunk_size: usize },
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Full(b) => f.debug_tuple("Full").field(&b.len()).finish(),
            Body::Stream(_) => f.write_str("Stream"),
            Body::File { path, chunk_size } => f
                .debug_struct("File")
                .field("path", path)
                .field("chunk_size", chunk_size)
                .finish(),
        }
    }
}

/// Outbound HTTP result.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderList,
    body: Body,
    media_type: Option<String>,
}

/// Text-like media types get a charset suffix when they lack one.
fn is_text_like(media_type: &str) -> bool {
    media_type.starts_with("text/")
        || media_type.starts_with("application/javascript")
        || media_type.starts_with("application/xml")
        || media_type.contains("+xml")
}

/// Render the `content-type` value for a media type.
pub fn content_type_value(media_type: &str) -> String {
    if is_text_like(media_type) && !media_type.contains("charset") {
        format!("{media_type}; charset=utf-8")
    } else {
        media_type.to_string()
    }
}

/// Guess a media type from a file extension.
pub fn guess_media_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") | Some("mjs") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") | Some("log") => "text/plain",
        Some("csv") => "text/csv",
        Some("xml") => "application/xml",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}

impl Response {
    /// Buffered response. `content-length` and `content-type` are injected
    /// unless `headers` already carries them.
    pub fn full(
        status: StatusCode,
        body: impl Into<Bytes>,
        media_type: Option<&str>,
        headers: HeaderList,
    ) -> Self {
        let body = body.into();
        let mut headers = headers;
        headers.set_default("content-length", body.len().to_string());
        if let Some(media_type) = media_type {
            headers.set_default("content-type", content_type_value(media_type));
        }
        Self {
            status,
            headers,
            body: Body::Full(body),
            media_type: media_type.map(str::to_string),
        }
    }

    /// Streamed response of unknown length.
    pub fn stream(
        status: StatusCode,
        stream: BodyStream,
        media_type: Option<&str>,
        headers: HeaderList,
    ) -> Self {
        let mut headers = headers;
        if let Some(media_type) = media_type {
            headers.set_default("content-type", content_type_value(media_type));
        }
        Self {
            status,
            headers,
            body: Body::Stream(stream),
            media_type: media_type.map(str::to_string),
        }
    }

    /// File-backed response; length and modification time are read at send time.
    pub fn file(path: impl Into<PathBuf>, media_type: Option<&str>, chunk_size: usize) -> Self {
        let path = path.into();
        let media_type = media_type.unwrap_or_else(|| guess_media_type(&path)).to_string();
        let mut headers = HeaderList::new();
        headers.append("content-type", content_type_value(&media_type));
        Self {
            status: StatusCode::OK,
            headers,
            body: Body::File {
                path,
                chunk_size: chunk_size.max(1),
            },
            media_type: Some(media_type),
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::full(StatusCode::OK, body.into(), Some("text/plain"), HeaderList::new())
    }

    pub fn html(body: impl Into<String>) -> Self {
        Self::full(StatusCode::OK, body.into(), Some("text/html"), HeaderList::new())
    }

    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::full(status, body, Some("application/json"), HeaderList::new()))
    }

    /// `{"detail": ...}` error body.
    pub fn detail(status: StatusCode, detail: &str, headers: HeaderList) -> Self {
        let body = serde_json::json!({ "detail": detail }).to_string();
        Self::full(status, body, Some("application/json"), headers)
    }

    /// Status plus `location`, empty body, `content-length: 0`.
    pub fn redirect(location: &str, status: StatusCode) -> Self {
        let mut headers = HeaderList::new();
        headers.append("location", location.to_string());
        Self::full(status, Bytes::new(), None, headers)
    }

    /// Empty buffered response.
    pub fn empty(status: StatusCode) -> Self {
        Self::full(status, Bytes::new(), None, HeaderList::new())
    }

    /// Build a response from handler output and (merged) route metadata.
    pub fn from_output(
        output: HandlerOutput,
        metadata: &RouteMetadata,
        file_chunk_size: usize,
    ) -> Result<Self> {
        let status = metadata.status.unwrap_or(StatusCode::OK);
        let mime = metadata.mime_type.as_deref();
        let headers = metadata.headers.clone();

        let response = match output {
            HandlerOutput::Empty => Self::full(status, Bytes::new(), None, headers),
            HandlerOutput::Text(text) => {
                Self::full(status, text, Some(mime.unwrap_or("text/plain")), headers)
            }
            HandlerOutput::Bytes(bytes) => Self::full(
                status,
                bytes,
                Some(mime.unwrap_or("application/octet-stream")),
                headers,
            ),
            HandlerOutput::Json(value) => Self::full(
                status,
                serde_json::to_vec(&value)?,
                Some(mime.unwrap_or("application/json")),
                headers,
            ),
            HandlerOutput::Stream(stream) => Self::stream(
                status,
                stream,
                Some(mime.unwrap_or("application/octet-stream")),
                headers,
            ),
            HandlerOutput::File(path) => {
                let mut response = Self::file(path, mime, file_chunk_size);
                response.status = status;
                for (name, value) in headers {
                    response.headers.set(&name, value);
                }
                response
            }
            HandlerOutput::Redirect { location, status } => Self::redirect(&location, status),
            HandlerOutput::Response(response) => response,
            HandlerOutput::Wrapped { output, metadata: wrapped } => {
                return Self::from_output(*output, &metadata.merge(&wrapped), file_chunk_size)
            }
        };
        Ok(response)
    }

    /// Append a header while the response is still being built.
    pub fn with_header(mut self, name: &str, value: impl Into<Bytes>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Append every header from `extra`.
    pub fn with_headers(mut self, extra: HeaderList) -> Self {
        self.headers.extend(extra);
        self
    }

    /// Add a `set-cookie` header while the response is still being built.
    pub fn with_cookie(self, cookie: &SetCookie) -> Self {
        let (_, value) = cookie.header();
        self.with_header("set-cookie", value)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    pub fn media_type(&self) -> Option<&str> {
        self.media_type.as_deref()
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Body length when known before sending.
    pub fn content_length(&self) -> Option<usize> {
        match &self.body {
            Body::Full(b) => Some(b.len()),
            _ => None,
        }
    }

    /// Emit the response. With `head_only`, headers go out unchanged and the
    /// body is replaced by a single empty final chunk.
    pub async fn send(self, outbound: &mut dyn Outbound, head_only: bool) -> Result<()> {
        let Response {
            status,
            mut headers,
            body,
            ..
        } = self;

        match body {
            Body::Full(bytes) => {
                outbound
                    .send(OutboundMessage::ResponseStart { status, headers })
                    .await?;
                let body = if head_only { Bytes::new() } else { bytes };
                outbound
                    .send(OutboundMessage::ResponseBody {
                        body,
                        more_body: false,
                    })
                    .await
            }
            Body::Stream(stream) => {
                outbound
                    .send(OutboundMessage::ResponseStart { status, headers })
                    .await?;
                if !head_only {
                    send_stream(outbound, stream).await?;
                }
                finish(outbound).await
            }
            Body::File { path, chunk_size } => {
                let meta = tokio::fs::metadata(&path).await?;
                headers.set_default("content-length", meta.len().to_string());
                if let Ok(modified) = meta.modified() {
                    headers.set_default("last-modified", httpdate::fmt_http_date(modified));
                }
                if head_only {
                    outbound
                        .send(OutboundMessage::ResponseStart { status, headers })
                        .await?;
                    return finish(outbound).await;
                }
                // Open before starting so a missing file is still a clean error.
                let file = tokio::fs::File::open(&path).await?;
                outbound
                    .send(OutboundMessage::ResponseStart { status, headers })
                    .await?;
                send_file(outbound, file, chunk_size).await?;
                finish(outbound).await
            }
        }
    }
}

async fn finish(outbound: &mut dyn Outbound) -> Result<()> {
    outbound
        .send(OutboundMessage::ResponseBody {
            body: Bytes::new(),
            more_body: false,
        })
        .await
}

async fn send_stream(outbound: &mut dyn Outbound, mut stream: BodyStream) -> Result<()> {
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }
        outbound
            .send(OutboundMessage::ResponseBody {
                body: chunk,
                more_body: true,
            })
            .await?;
    }
    Ok(())
}

async fn send_file(
    outbound: &mut dyn Outbound,
    mut file: tokio::fs::File,
    chunk_size: usize,
) -> Result<()> {
    loop {
        let mut buf = BytesMut::with_capacity(chunk_size);
        let read = (&mut file).take(chunk_size as u64).read_buf(&mut buf).await?;
        if read == 0 {
            return Ok(());
        }
        outbound
            .send(OutboundMessage::ResponseBody {
                body: buf.freeze(),
                more_body: true,
            })
            .await?;
    }
}

/// Parse an HTTP date header value.
pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    httpdate::parse_http_date(value.trim()).ok()
}

impl From<EngineError> for Response {
    /// Minimal translation used when no `errors` interceptor is configured.
    fn from(err: EngineError) -> Self {
        crate::middleware::errors::error_response(&err, false)
    }
}
