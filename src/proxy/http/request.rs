use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{Method, Uri};
use thiserror::Error;
use tokio::io::{AsyncRead, BufReader};

use super::line::{HeadBudget, line_str, read_line_with_timeout};

const DEFAULT_HTTP_PORT: u16 = 80;

/// A complete request head that cannot be served. Answered with 400 rather
/// than a dropped connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed request: {0}")]
pub struct MalformedRequest(String);

impl MalformedRequest {
    fn new(reason: &str) -> Self {
        Self(reason.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderLine {
    pub name: String,
    pub value: String,
    lower_name: String,
}

impl HeaderLine {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let lower_name = name.to_ascii_lowercase();
        Self {
            name,
            value: value.into(),
            lower_name,
        }
    }

    pub fn lower_name(&self) -> &str {
        &self.lower_name
    }

    pub(crate) fn parse(line: &str) -> Result<Self> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        let name = name.trim();
        ensure!(!name.is_empty(), "header name must not be empty");
        http::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}'"))?;
        Ok(Self::new(name, value.trim()))
    }
}

/// Client request head as read off the wire, before target resolution.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<HeaderLine>,
    pub head_bytes: usize,
}

impl RequestHead {
    pub fn is_get(&self) -> bool {
        self.method == Method::GET.as_str()
    }

    pub fn header(&self, lower_name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.lower_name() == lower_name)
            .map(|header| header.value.as_str())
    }

    /// Resolves where the request goes and what it is cached under.
    pub fn resolve(&self) -> Result<ProxyRequest> {
        let (authority, path) = if self.target.starts_with('/') {
            let host = self
                .header("host")
                .ok_or_else(|| anyhow!("origin-form request without Host header"))?;
            (host.trim().to_string(), self.target.clone())
        } else {
            let uri: Uri = self
                .target
                .parse()
                .with_context(|| format!("invalid request target '{}'", self.target))?;
            match uri.scheme_str() {
                Some(scheme) if scheme.eq_ignore_ascii_case("http") => {}
                Some(other) => bail!("unsupported scheme '{other}'"),
                None => bail!("request target must be absolute-form or origin-form"),
            }
            let authority = uri
                .authority()
                .ok_or_else(|| anyhow!("request target missing authority"))?
                .as_str()
                .to_string();
            let path = uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .filter(|pq| !pq.is_empty())
                .unwrap_or_else(|| "/".to_string());
            (authority, path)
        };

        let (connect_host, port) = split_authority(&authority)?;
        Ok(ProxyRequest {
            host: authority,
            connect_host,
            port,
            path,
            client_specific: self
                .headers
                .iter()
                .any(|header| is_client_specific(header.lower_name())),
            forward_headers: forwardable_headers(&self.headers),
        })
    }
}

/// A GET request ready to be served from cache or forwarded.
///
/// `host` and `path` are the cache key and are kept exactly as the client
/// sent them; `connect_host`/`port` are only used to dial upstream.
/// `client_specific` marks requests whose response depends on more than the
/// key (ranges, validators, credentials); those are never cached.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub host: String,
    pub connect_host: String,
    pub port: u16,
    pub path: String,
    pub client_specific: bool,
    pub forward_headers: Vec<HeaderLine>,
}

impl ProxyRequest {
    pub fn upstream_addr(&self) -> String {
        if self.connect_host.contains(':') {
            format!("[{}]:{}", self.connect_host, self.port)
        } else {
            format!("{}:{}", self.connect_host, self.port)
        }
    }

    /// Serializes the request sent upstream. One request per connection.
    pub fn encode_upstream(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(256);
        buffer.extend_from_slice(b"GET ");
        buffer.extend_from_slice(self.path.as_bytes());
        buffer.extend_from_slice(b" HTTP/1.1\r\nHost: ");
        buffer.extend_from_slice(self.host.as_bytes());
        buffer.extend_from_slice(b"\r\n");
        for header in &self.forward_headers {
            buffer.extend_from_slice(header.name.as_bytes());
            buffer.extend_from_slice(b": ");
            buffer.extend_from_slice(header.value.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }
        buffer.extend_from_slice(b"Connection: close\r\n\r\n");
        buffer
    }
}

pub async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let mut budget = HeadBudget::new(max_header_bytes, "request headers exceed configured limit")?;
    let mut line = Vec::new();

    let read =
        read_line_with_timeout(reader, &mut line, timeout_dur, peer, budget.remaining()).await?;
    if read == 0 {
        return Ok(None);
    }
    budget.record(read)?;
    let request_line = parse_request_line(&line);

    // The whole head is consumed even when it is malformed so the 400 reply
    // is not lost to a reset.
    let mut header_error = None;
    let mut headers = Vec::new();
    loop {
        let remaining = budget.remaining();
        ensure!(remaining > 0, "request headers exceed configured limit");
        let read = read_line_with_timeout(reader, &mut line, timeout_dur, peer, remaining).await?;
        if read == 0 {
            bail!("connection closed during request headers from {peer}");
        }
        budget.record(read)?;
        let Ok(text) = line_str(&line) else {
            header_error.get_or_insert_with(|| MalformedRequest::new("header is not valid UTF-8"));
            continue;
        };
        if text.is_empty() {
            break;
        }
        match HeaderLine::parse(text) {
            Ok(header) => headers.push(header),
            Err(err) => {
                header_error
                    .get_or_insert_with(|| MalformedRequest(format!("invalid header: {err}")));
            }
        }
    }

    let RequestLine {
        method,
        target,
        version,
    } = request_line?;
    if let Some(err) = header_error {
        return Err(err.into());
    }

    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
        head_bytes: max_header_bytes - budget.remaining(),
    }))
}

struct RequestLine {
    method: String,
    target: String,
    version: String,
}

fn parse_request_line(line: &[u8]) -> Result<RequestLine, MalformedRequest> {
    let text =
        line_str(line).map_err(|_| MalformedRequest::new("request line is not valid UTF-8"))?;
    let mut parts = text.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| MalformedRequest::new("request line missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| MalformedRequest::new("request line missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| MalformedRequest::new("request line missing version"))?;
    if parts.next().is_some() {
        return Err(MalformedRequest::new("unexpected data after HTTP version"));
    }
    if !matches!(version, "HTTP/1.0" | "HTTP/1.1") {
        return Err(MalformedRequest(format!("invalid HTTP version '{version}'")));
    }
    Method::from_bytes(method.as_bytes())
        .map_err(|_| MalformedRequest(format!("invalid method '{method}'")))?;
    Ok(RequestLine {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
    })
}

fn split_authority(authority: &str) -> Result<(String, u16)> {
    ensure!(!authority.is_empty(), "empty Host header");
    ensure!(
        !authority.contains(|c: char| c.is_whitespace() || matches!(c, '@' | '/' | '?' | '#')),
        "invalid authority '{authority}'"
    );
    let uri: Uri = format!("http://{authority}")
        .parse()
        .with_context(|| format!("invalid authority '{authority}'"))?;
    let host = uri
        .host()
        .ok_or_else(|| anyhow!("authority missing hostname"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    Ok((host, uri.port_u16().unwrap_or(DEFAULT_HTTP_PORT)))
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
            | "host"
    ) || name.starts_with("proxy-")
}

/// Request headers that make the upstream answer differ from the plain
/// response stored under host and path.
fn is_client_specific(name: &str) -> bool {
    name.starts_with("if-") || matches!(name, "range" | "authorization" | "cookie")
}

/// End-to-end headers to pass upstream. Hop-by-hop headers and anything the
/// client listed in `Connection` are dropped; Host is rewritten separately.
/// Accept-Encoding is dropped as well so stored bodies are always identity
/// encoded.
fn forwardable_headers(headers: &[HeaderLine]) -> Vec<HeaderLine> {
    let connection_tokens: HashSet<String> = headers
        .iter()
        .filter(|header| header.lower_name() == "connection")
        .flat_map(|header| header.value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();
    headers
        .iter()
        .filter(|header| {
            let name = header.lower_name();
            !is_hop_by_hop(name) && name != "accept-encoding" && !connection_tokens.contains(name)
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn parse(raw: &[u8]) -> Result<Option<RequestHead>> {
        let (mut tx, rx) = tokio::io::duplex(4096);
        tx.write_all(raw).await?;
        drop(tx);
        let mut reader = BufReader::new(rx);
        read_request_head(
            &mut reader,
            Duration::from_secs(1),
            "127.0.0.1:1".parse().unwrap(),
            1024,
        )
        .await
    }

    #[tokio::test]
    async fn absolute_form_keeps_authority_and_path() -> Result<()> {
        let head = parse(b"GET http://example.com:8080/a/b?q=1 HTTP/1.1\r\nAccept: */*\r\n\r\n")
            .await?
            .unwrap();
        assert!(head.is_get());
        let request = head.resolve()?;
        assert_eq!(request.host, "example.com:8080");
        assert_eq!(request.connect_host, "example.com");
        assert_eq!(request.port, 8080);
        assert_eq!(request.path, "/a/b?q=1");
        Ok(())
    }

    #[tokio::test]
    async fn origin_form_uses_host_header() -> Result<()> {
        let head = parse(b"GET /index.html HTTP/1.1\r\nHost: Example.COM\r\n\r\n")
            .await?
            .unwrap();
        let request = head.resolve()?;
        assert_eq!(request.host, "Example.COM");
        assert_eq!(request.port, 80);
        assert_eq!(request.path, "/index.html");
        Ok(())
    }

    #[tokio::test]
    async fn absolute_form_without_path_defaults_to_root() -> Result<()> {
        let head = parse(b"GET http://example.com HTTP/1.1\r\n\r\n")
            .await?
            .unwrap();
        assert_eq!(head.resolve()?.path, "/");
        Ok(())
    }

    #[tokio::test]
    async fn non_get_methods_parse_but_are_flagged() -> Result<()> {
        let head = parse(b"POST http://example.com/ HTTP/1.1\r\n\r\n")
            .await?
            .unwrap();
        assert!(!head.is_get());
        let head = parse(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await?
            .unwrap();
        assert!(!head.is_get());
        Ok(())
    }

    #[tokio::test]
    async fn empty_stream_is_no_request() -> Result<()> {
        assert!(parse(b"").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Fill: ".to_vec();
        raw.extend(std::iter::repeat_n(b'a', 2048));
        raw.extend_from_slice(b"\r\n\r\n");
        assert!(parse(&raw).await.is_err());
    }

    fn is_malformed(result: &Result<Option<RequestHead>>) -> bool {
        matches!(result, Err(err) if err.downcast_ref::<MalformedRequest>().is_some())
    }

    #[tokio::test]
    async fn malformed_request_lines_are_rejected() {
        assert!(is_malformed(&parse(b"GET\r\n\r\n").await));
        assert!(is_malformed(&parse(b"GET / HTTP/2.0\r\n\r\n").await));
        assert!(is_malformed(&parse(b"GET / HTTP/1.1\r\nbad header\r\n\r\n").await));
    }

    #[tokio::test]
    async fn invalid_utf8_target_is_malformed_not_replaced() {
        let result = parse(b"GET http://example.com/\xff HTTP/1.1\r\n\r\n").await;
        assert!(is_malformed(&result));
        let result = parse(b"GET http://example.com/\xfe HTTP/1.1\r\n\r\n").await;
        assert!(is_malformed(&result));
    }

    #[tokio::test]
    async fn invalid_utf8_host_header_is_malformed() {
        let result = parse(b"GET /a HTTP/1.1\r\nHost: ex\xffample.com\r\n\r\n").await;
        assert!(is_malformed(&result));
    }

    #[tokio::test]
    async fn limit_errors_are_not_reported_as_malformed() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Fill: ".to_vec();
        raw.extend(std::iter::repeat_n(b'a', 2048));
        raw.extend_from_slice(b"\r\n\r\n");
        let result = parse(&raw).await;
        assert!(result.is_err());
        assert!(!is_malformed(&result));
    }

    #[test]
    fn conditional_and_credentialed_requests_are_client_specific() -> Result<()> {
        let with_header = |name: &str| RequestHead {
            method: "GET".into(),
            target: "http://example.com/x".into(),
            version: "HTTP/1.1".into(),
            headers: vec![HeaderLine::new(name, "v")],
            head_bytes: 0,
        };
        for name in [
            "Range",
            "If-None-Match",
            "If-Modified-Since",
            "If-Range",
            "Authorization",
            "Cookie",
        ] {
            assert!(with_header(name).resolve()?.client_specific, "{name}");
        }
        for name in ["Accept", "User-Agent", "Accept-Encoding"] {
            assert!(!with_header(name).resolve()?.client_specific, "{name}");
        }
        Ok(())
    }

    #[test]
    fn upstream_request_strips_hop_by_hop_headers() -> Result<()> {
        let head = RequestHead {
            method: "GET".into(),
            target: "/x".into(),
            version: "HTTP/1.1".into(),
            headers: vec![
                HeaderLine::new("Host", "example.com"),
                HeaderLine::new("Accept", "text/html"),
                HeaderLine::new("Accept-Encoding", "gzip"),
                HeaderLine::new("Connection", "keep-alive, X-Secret"),
                HeaderLine::new("X-Secret", "1"),
                HeaderLine::new("Proxy-Authorization", "Basic abc"),
            ],
            head_bytes: 0,
        };
        let encoded = String::from_utf8(head.resolve()?.encode_upstream())?;
        assert_eq!(
            encoded,
            "GET /x HTTP/1.1\r\nHost: example.com\r\nAccept: text/html\r\nConnection: close\r\n\r\n"
        );
        Ok(())
    }

    #[test]
    fn ipv6_authority_is_bracketed_for_dialing() -> Result<()> {
        let head = RequestHead {
            method: "GET".into(),
            target: "http://[::1]:8080/".into(),
            version: "HTTP/1.1".into(),
            headers: Vec::new(),
            head_bytes: 0,
        };
        let request = head.resolve()?;
        assert_eq!(request.host, "[::1]:8080");
        assert_eq!(request.upstream_addr(), "[::1]:8080");
        Ok(())
    }
}
