//! Upstream connection and request forwarding
//!
//! This module handles connecting to backend servers and forwarding
//! HTTP requests/responses. One connection per forwarded request
//! (`Connection: close`); the full response is read before it is handed
//! back, so callers only ever see complete bodies.

use anyhow::{Context, Result};
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::GatewayError;
use crate::http::parser::find_headers_end;
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::proxy::backend::Backend;
use crate::proxy::resilience::ForwardCall;

/// Default buffer size for streaming
const BUFFER_SIZE: usize = 8192;

/// Largest response head accepted from a backend
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Largest response body accepted from a backend
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Headers that describe one hop and must not be forwarded
const HOP_BY_HOP: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Proxy-Connection",
    "Transfer-Encoding",
    "Upgrade",
    "TE",
    "Trailer",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Forwards requests to backend servers
#[derive(Debug, Clone)]
pub struct Upstream {
    /// Connection timeout duration
    connection_timeout: Duration,

    /// Request timeout duration (send + full response)
    request_timeout: Duration,
}

impl Upstream {
    pub fn new(connection_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connection_timeout,
            request_timeout,
        }
    }

    /// Forward `request` to `backend`, asking for `target` (path and query).
    ///
    /// Any failure, including a timeout, is reported as
    /// [`GatewayError::BackendUnavailable`]. Backend error statuses are not
    /// failures; they are returned as responses.
    pub async fn forward(
        &self,
        backend: &Backend,
        request: &Request,
        target: &str,
    ) -> Result<Response, GatewayError> {
        tracing::debug!(
            backend = backend.display_name(),
            method = %request.method,
            target = %target,
            "Forwarding request to backend"
        );

        match self.proxy_to_backend(backend, request, target).await {
            Ok(response) => {
                tracing::info!(
                    backend = backend.display_name(),
                    status = response.status.as_u16(),
                    method = %request.method,
                    target = %target,
                    "Request forwarded successfully"
                );
                Ok(response)
            }
            Err(e) => {
                tracing::warn!(
                    backend = backend.display_name(),
                    error = %format!("{:#}", e),
                    method = %request.method,
                    target = %target,
                    "Failed to proxy request to backend"
                );
                Err(GatewayError::backend_unavailable(backend.display_name(), &e))
            }
        }
    }

    /// Proxy a request to a specific backend
    async fn proxy_to_backend(
        &self,
        backend: &Backend,
        request: &Request,
        target: &str,
    ) -> Result<Response> {
        let addr = backend.authority()?;

        // Connect to backend with timeout
        let stream = timeout(self.connection_timeout, TcpStream::connect(&addr))
            .await
            .context("Connection timeout")?
            .context("Failed to connect to backend")?;

        tracing::trace!(backend = backend.display_name(), "Connected to backend");

        // Forward request and get response with timeout
        timeout(
            self.request_timeout,
            self.send_request_and_receive_response(stream, request, target, &backend.url),
        )
        .await
        .context("Request timeout")?
    }

    /// Send request to backend and receive response
    async fn send_request_and_receive_response(
        &self,
        mut stream: TcpStream,
        request: &Request,
        target: &str,
        backend_url: &url::Url,
    ) -> Result<Response> {
        let request_bytes = self.build_http_request(request, target, backend_url);
        stream.write_all(&request_bytes).await?;
        stream.flush().await?;

        tracing::trace!("Request sent to backend");

        self.read_http_response(&mut stream, request.method == Method::HEAD)
            .await
    }

    /// Build HTTP request bytes to send to backend
    pub fn build_http_request(&self, request: &Request, target: &str, backend_url: &url::Url) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(512 + request.body.len());

        let target = if target.is_empty() { "/" } else { target };
        buffer.extend_from_slice(
            format!("{} {} {}\r\n", request.method, target, request.version).as_bytes(),
        );

        for (key, value) in &request.headers {
            if is_hop_by_hop(key)
                || key.eq_ignore_ascii_case("Host")
                || key.eq_ignore_ascii_case("Content-Length")
            {
                continue;
            }
            buffer.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
        }

        // Host header names the backend, not the gateway
        if let Some(host) = backend_url.host_str() {
            let host_value = match backend_url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            };
            buffer.extend_from_slice(format!("Host: {}\r\n", host_value).as_bytes());
        }

        if !request.body.is_empty() {
            buffer.extend_from_slice(format!("Content-Length: {}\r\n", request.body.len()).as_bytes());
        }

        // One request per upstream connection
        buffer.extend_from_slice(b"Connection: close\r\n");

        // End of headers
        buffer.extend_from_slice(b"\r\n");

        buffer.extend_from_slice(&request.body);

        buffer
    }

    /// Read a complete HTTP response. `head_request` suppresses the body.
    pub async fn read_http_response<R>(&self, stream: &mut R, head_request: bool) -> Result<Response>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

        // Read response headers
        let headers_end = loop {
            if let Some(end) = find_headers_end(&buffer) {
                break end;
            }

            // Prevent unbounded header growth
            if buffer.len() > MAX_HEAD_BYTES {
                anyhow::bail!("Response headers too large");
            }

            let n = stream.read_buf(&mut buffer).await?;
            if n == 0 {
                anyhow::bail!("Connection closed before complete response received");
            }
        };

        let head = buffer.split_to(headers_end + 4);
        let (status, mut headers) = self.parse_response_headers(&head)?;

        let has_body = !head_request
            && !(100..200).contains(&status.as_u16())
            && status != StatusCode::NO_CONTENT
            && status.as_u16() != 304;

        let chunked = header_value(&headers, "Transfer-Encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));

        let body = if !has_body {
            Vec::new()
        } else if chunked {
            read_chunked_body(stream, &mut buffer).await?
        } else if let Some(cl) = header_value(&headers, "Content-Length") {
            let content_length: usize = cl.trim().parse().context("Invalid Content-Length")?;
            if content_length > MAX_BODY_BYTES {
                anyhow::bail!("Response body too large");
            }
            read_exact(stream, &mut buffer, content_length).await?.to_vec()
        } else {
            // No framing: the backend closes the connection when done
            read_to_end(stream, &mut buffer).await?
        };

        headers.retain(|(k, _)| !is_hop_by_hop(k));
        if has_body {
            headers.retain(|(k, _)| !k.eq_ignore_ascii_case("Content-Length"));
            headers.push(("Content-Length".to_string(), body.len().to_string()));
        }

        Ok(Response {
            status,
            headers,
            body,
        })
    }

    /// Parse response status line and headers
    fn parse_response_headers(&self, headers_bytes: &[u8]) -> Result<(StatusCode, Vec<(String, String)>)> {
        let headers_str =
            std::str::from_utf8(headers_bytes).context("Invalid UTF-8 in response headers")?;

        let mut lines = headers_str.lines();

        let status_line = lines.next().context("Empty response")?;
        let parts: Vec<&str> = status_line.splitn(3, ' ').collect();

        if parts.len() < 2 || !parts[0].starts_with("HTTP/") {
            anyhow::bail!("Invalid status line: {}", status_line);
        }

        let status_code: u16 = parts[1].parse().context("Invalid status code")?;
        if !(100..=999).contains(&status_code) {
            anyhow::bail!("Invalid status code: {}", status_code);
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }

            if let Some((key, value)) = line.split_once(':') {
                headers.push((key.trim().to_string(), value.trim().to_string()));
            }
        }

        Ok((StatusCode(status_code), headers))
    }
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

async fn read_more<R: AsyncRead + Unpin>(stream: &mut R, buffer: &mut BytesMut) -> Result<()> {
    let n = stream.read_buf(buffer).await?;
    if n == 0 {
        anyhow::bail!("Connection closed before complete body received");
    }
    Ok(())
}

async fn read_exact<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer: &mut BytesMut,
    len: usize,
) -> Result<BytesMut> {
    while buffer.len() < len {
        read_more(stream, buffer).await?;
    }
    Ok(buffer.split_to(len))
}

async fn read_line<R: AsyncRead + Unpin>(stream: &mut R, buffer: &mut BytesMut) -> Result<BytesMut> {
    loop {
        if let Some(pos) = buffer.windows(2).position(|w| w == b"\r\n") {
            let line = buffer.split_to(pos);
            buffer.advance(2);
            return Ok(line);
        }
        if buffer.len() > BUFFER_SIZE {
            anyhow::bail!("Chunk header too long");
        }
        read_more(stream, buffer).await?;
    }
}

async fn read_chunked_body<R: AsyncRead + Unpin>(stream: &mut R, buffer: &mut BytesMut) -> Result<Vec<u8>> {
    let mut body = Vec::new();

    loop {
        let line = read_line(stream, buffer).await?;
        let size_field = std::str::from_utf8(&line)
            .context("Invalid chunk header")?
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        let size = usize::from_str_radix(size_field, 16).context("Invalid chunk size")?;

        if size == 0 {
            // Skip trailers up to the terminating empty line
            while !read_line(stream, buffer).await?.is_empty() {}
            return Ok(body);
        }

        if body.len().checked_add(size).is_none_or(|total| total > MAX_BODY_BYTES) {
            anyhow::bail!("Response body too large");
        }

        body.extend_from_slice(&read_exact(stream, buffer, size).await?);
        if &read_exact(stream, buffer, 2).await?[..] != b"\r\n" {
            anyhow::bail!("Missing CRLF after chunk");
        }
    }
}

async fn read_to_end<R: AsyncRead + Unpin>(stream: &mut R, buffer: &mut BytesMut) -> Result<Vec<u8>> {
    loop {
        if buffer.len() > MAX_BODY_BYTES {
            anyhow::bail!("Response body too large");
        }
        if stream.read_buf(buffer).await? == 0 {
            return Ok(buffer.split().to_vec());
        }
    }
}

/// A single forwarding attempt, handed to the resilience policy.
pub struct UpstreamCall<'a> {
    pub upstream: &'a Upstream,
    pub backend: &'a Backend,
    pub request: &'a Request,
    pub target: &'a str,
}

#[async_trait::async_trait]
impl ForwardCall for UpstreamCall<'_> {
    async fn attempt(&self) -> Result<Response, GatewayError> {
        self.upstream
            .forward(self.backend, self.request, self.target)
            .await
    }

    fn backend(&self) -> &str {
        self.backend.display_name()
    }
}
