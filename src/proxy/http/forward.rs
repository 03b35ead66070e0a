use std::net::SocketAddr;
use std::time::Instant;

use anyhow::{Context, Result};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::logging::{AccessLogBuilder, CacheLookup};
use crate::proxy::AppContext;
use crate::proxy::cache::{CacheSkipReason, CacheStoreOutcome, CachedResponse, CacheWriter};
use crate::util::timeout_with_context;

use super::body::{RelayTimeouts, relay_body};
use super::request::{MalformedRequest, ProxyRequest, read_request_head};
use super::response::read_response_head;

const FORBIDDEN_RESPONSE: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\n";
const BAD_REQUEST_RESPONSE: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const BAD_GATEWAY_RESPONSE: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Serves one request on a client connection: replays a cache hit, or
/// forwards to the origin while filling the cache.
pub async fn handle_http<S>(stream: S, peer: SocketAddr, app: AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let start = Instant::now();
    let settings = app.settings.clone();
    let (read_half, mut client) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let head = match read_request_head(
        &mut reader,
        settings.client_timeout(),
        peer,
        settings.max_header_size,
    )
    .await
    {
        Ok(Some(head)) => head,
        Ok(None) => {
            debug!(peer = %peer, "connection closed before request line");
            return Ok(());
        }
        Err(err) => match err.downcast_ref::<MalformedRequest>() {
            Some(malformed) => {
                let sent = respond_static(&mut client, BAD_REQUEST_RESPONSE, &app).await;
                AccessLogBuilder::new(peer)
                    .status(StatusCode::BAD_REQUEST)
                    .bytes_out(sent)
                    .error_reason("malformed_request")
                    .error_detail(malformed.to_string())
                    .elapsed(start.elapsed())
                    .log();
                return Ok(());
            }
            None => return Err(err),
        },
    };

    let log = AccessLogBuilder::new(peer)
        .method(head.method.clone())
        .bytes_in(head.head_bytes as u64);

    if !head.is_get() {
        let sent = respond_static(&mut client, FORBIDDEN_RESPONSE, &app).await;
        log.path(head.target.clone())
            .status(StatusCode::FORBIDDEN)
            .bytes_out(sent)
            .error_reason("method_not_allowed")
            .elapsed(start.elapsed())
            .log();
        return Ok(());
    }

    let request = match head.resolve() {
        Ok(request) => request,
        Err(err) => {
            let sent = respond_static(&mut client, BAD_REQUEST_RESPONSE, &app).await;
            log.path(head.target.clone())
                .status(StatusCode::BAD_REQUEST)
                .bytes_out(sent)
                .error_reason("invalid_target")
                .error_detail(format!("{err:#}"))
                .elapsed(start.elapsed())
                .log();
            return Ok(());
        }
    };
    let log = log.host(request.host.clone()).path(request.path.clone());

    let cache = app.cache.as_ref().filter(|_| !request.client_specific);
    let log = match cache {
        Some(cache) => match cache.lookup(&request.host, &request.path) {
            Some(hit) => {
                let status = status_from_code(hit.status_code);
                let result = replay_hit(&mut client, &hit, &app).await;
                let log = log
                    .cache_hit(hit.total_size)
                    .status(status)
                    .bytes_out(if result.is_ok() { hit.total_size } else { 0 })
                    .elapsed(start.elapsed());
                return match result {
                    Ok(()) => {
                        log.log();
                        Ok(())
                    }
                    Err(err) => {
                        log.error_reason("client_write_failed")
                            .error_detail(format!("{err:#}"))
                            .log();
                        Err(err)
                    }
                };
            }
            None => log.cache_lookup(CacheLookup::Miss),
        },
        None => log.cache_lookup(CacheLookup::Bypass),
    };

    forward_miss(&mut client, &request, &app, log, start).await
}

async fn forward_miss<C>(
    client: &mut C,
    request: &ProxyRequest,
    app: &AppContext,
    log: AccessLogBuilder,
    start: Instant,
) -> Result<()>
where
    C: AsyncWrite + Unpin,
{
    let settings = &app.settings;
    let upstream_addr = request.upstream_addr();
    let log = log.upstream_addr(upstream_addr.clone());

    let upstream = match open_upstream(request, app).await {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!(upstream = %upstream_addr, error = %err, "upstream request failed");
            crate::metrics::record_upstream_error("connect");
            let sent = respond_static(client, BAD_GATEWAY_RESPONSE, app).await;
            log.status(StatusCode::BAD_GATEWAY)
                .bytes_out(sent)
                .error_reason("upstream_connect_failed")
                .error_detail(format!("{err:#}"))
                .elapsed(start.elapsed())
                .log();
            return Ok(());
        }
    };
    let upstream_peer = upstream.peer_addr().context("reading upstream peer address")?;
    let mut upstream = BufReader::new(upstream);

    let head = match read_response_head(
        &mut upstream,
        settings.upstream_timeout(),
        upstream_peer,
        settings.max_header_size,
    )
    .await
    {
        Ok(head) => head,
        Err(err) => {
            warn!(upstream = %upstream_peer, error = %err, "invalid upstream response head");
            crate::metrics::record_upstream_error("response_head");
            let sent = respond_static(client, BAD_GATEWAY_RESPONSE, app).await;
            log.status(StatusCode::BAD_GATEWAY)
                .bytes_out(sent)
                .error_reason("upstream_response_invalid")
                .error_detail(format!("{err:#}"))
                .elapsed(start.elapsed())
                .log();
            return Ok(());
        }
    };
    let status = status_from_code(head.status_code);
    let log = log.status(status);

    if let Err(err) = timeout_with_context(
        settings.client_timeout(),
        client.write_all(&head.raw),
        "writing response head to client",
    )
    .await
    {
        log.error_reason("client_write_failed")
            .error_detail(format!("{err:#}"))
            .elapsed(start.elapsed())
            .log();
        return Err(err);
    }

    let (mut writer, log) = match app.cache.as_ref() {
        Some(_) if request.client_specific => (
            None,
            log.cache_store(
                CacheStoreOutcome::Skipped(CacheSkipReason::ClientSpecific),
                0,
                0,
            ),
        ),
        Some(cache) => (
            Some(cache.open_writer(&request.host, &request.path, head.cache_meta())),
            log,
        ),
        None => (None, log),
    };
    if let Some(writer) = writer.as_mut() {
        writer.push(&head.raw);
    }

    let timeouts = RelayTimeouts {
        upstream: settings.upstream_timeout(),
        client: settings.client_timeout(),
    };
    let relayed = relay_body(
        &mut upstream,
        client,
        head.body_plan(),
        writer.as_mut(),
        &timeouts,
        upstream_peer,
    )
    .await;

    let head_len = head.raw.len() as u64;
    match relayed {
        Ok(body_bytes) => {
            close_writer(log, writer, CacheWriter::finish)
                .bytes_out(head_len.saturating_add(body_bytes))
                .elapsed(start.elapsed())
                .log();
            Ok(())
        }
        Err(err) => {
            close_writer(log, writer, CacheWriter::abort)
                .bytes_out(head_len)
                .error_reason("relay_failed")
                .error_detail(format!("{err:#}"))
                .elapsed(start.elapsed())
                .log();
            Err(err)
        }
    }
}

async fn open_upstream(request: &ProxyRequest, app: &AppContext) -> Result<TcpStream> {
    let settings = &app.settings;
    let addr = request.upstream_addr();
    let mut stream = timeout_with_context(
        settings.upstream_connect_timeout(),
        TcpStream::connect(addr.as_str()),
        format!("connecting to {addr}"),
    )
    .await?;
    if let Err(err) = stream.set_nodelay(true) {
        debug!(upstream = %addr, error = %err, "failed to set TCP_NODELAY on upstream stream");
    }
    timeout_with_context(
        settings.upstream_timeout(),
        stream.write_all(&request.encode_upstream()),
        format!("writing request to {addr}"),
    )
    .await?;
    Ok(stream)
}

async fn replay_hit<C>(client: &mut C, hit: &CachedResponse, app: &AppContext) -> Result<()>
where
    C: AsyncWrite + Unpin,
{
    let timeout = app.settings.client_timeout();
    for chunk in &hit.chunks {
        timeout_with_context(
            timeout,
            client.write_all(chunk),
            "writing cached response to client",
        )
        .await?;
    }
    timeout_with_context(timeout, client.flush(), "flushing cached response").await
}

/// Best effort: the client may already be gone. Returns bytes written.
async fn respond_static<C>(client: &mut C, response: &[u8], app: &AppContext) -> u64
where
    C: AsyncWrite + Unpin,
{
    let timeout = app.settings.client_timeout();
    let result = async {
        timeout_with_context(timeout, client.write_all(response), "writing response").await?;
        timeout_with_context(timeout, client.flush(), "flushing response").await
    }
    .await;
    match result {
        Ok(()) => response.len() as u64,
        Err(err) => {
            debug!(error = %err, "failed to write error response");
            0
        }
    }
}

/// Ends the cache fill with `close` and records what happened to the entry.
fn close_writer(
    log: AccessLogBuilder,
    writer: Option<CacheWriter>,
    close: fn(CacheWriter) -> CacheStoreOutcome,
) -> AccessLogBuilder {
    let Some(writer) = writer else {
        return log;
    };
    let entry_bytes = writer.written();
    let evicted_bytes = writer.evicted_bytes();
    log.cache_store(close(writer), entry_bytes, evicted_bytes)
}

fn status_from_code(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY)
}
