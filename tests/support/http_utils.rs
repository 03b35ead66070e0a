use std::net::SocketAddr;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub async fn read_http_response<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    timeout(StdDuration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .map_err(|_| anyhow!("timed out reading proxy response"))??;
    Ok(buf)
}

/// Sends one absolute-form request through the proxy and reads the whole reply.
pub async fn proxy_request(
    proxy: SocketAddr,
    method: &str,
    upstream: SocketAddr,
    path: &str,
) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(proxy).await?;
    let request = format!(
        "{method} http://{upstream}{path} HTTP/1.1\r\nHost: {upstream}\r\nUser-Agent: cacheproxy-test\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;
    read_http_response(&mut stream).await
}

pub async fn proxy_get(proxy: SocketAddr, upstream: SocketAddr, path: &str) -> Result<Vec<u8>> {
    proxy_request(proxy, "GET", upstream, path).await
}

/// GET through the proxy with extra header lines, each ending in CRLF.
pub async fn proxy_get_with_headers(
    proxy: SocketAddr,
    upstream: SocketAddr,
    path: &str,
    extra_headers: &str,
) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(proxy).await?;
    let request = format!(
        "GET http://{upstream}{path} HTTP/1.1\r\nHost: {upstream}\r\n{extra_headers}\r\n"
    );
    stream.write_all(request.as_bytes()).await?;
    read_http_response(&mut stream).await
}

pub fn status_code(response: &[u8]) -> Result<u16> {
    let text = String::from_utf8_lossy(response);
    let line = text
        .lines()
        .next()
        .ok_or_else(|| anyhow!("empty response"))?;
    line.split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("missing status code in response line"))?
        .parse::<u16>()
        .context("invalid status code")
}

pub async fn read_until_double_crlf(stream: &mut TcpStream) -> Result<String> {
    let mut buffer = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let bytes = stream.read(&mut byte).await?;
        if bytes == 0 {
            break;
        }
        buffer.extend_from_slice(&byte);
        if buffer.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8(buffer).context("invalid UTF-8 request")
}
