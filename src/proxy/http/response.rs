use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use tokio::io::{AsyncRead, BufReader};
use tracing::warn;

use crate::proxy::cache::ResponseMeta;

use super::body::BodyPlan;
use super::line::{HeadBudget, line_text, read_line_with_timeout};
use super::request::HeaderLine;

/// Upstream response head. `raw` holds the bytes exactly as received and is
/// what gets relayed and cached; the parsed fields only drive framing and
/// cache metadata.
#[derive(Debug, Clone)]
pub struct UpstreamResponseHead {
    pub raw: Vec<u8>,
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<HeaderLine>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

impl UpstreamResponseHead {
    pub fn body_plan(&self) -> BodyPlan {
        if (100..200).contains(&self.status_code)
            || self.status_code == 204
            || self.status_code == 304
        {
            return BodyPlan::Empty;
        }
        if self.chunked {
            return BodyPlan::Chunked;
        }
        match self.content_length {
            Some(0) => BodyPlan::Empty,
            Some(length) => BodyPlan::Fixed(length),
            None => BodyPlan::UntilClose,
        }
    }

    /// Cache metadata. The total size is known for fixed and empty bodies.
    pub fn cache_meta(&self) -> ResponseMeta {
        let mut meta = ResponseMeta::new(self.status_code, self.status_text.clone());
        if let Some(content_type) = &self.content_type {
            meta = meta.with_content_type(content_type.clone());
        }
        let head_len = self.raw.len() as u64;
        match self.body_plan() {
            BodyPlan::Empty => meta.with_total_size(head_len),
            BodyPlan::Fixed(length) => meta.with_total_size(head_len.saturating_add(length)),
            BodyPlan::Chunked | BodyPlan::UntilClose => meta,
        }
    }
}

pub async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<UpstreamResponseHead>
where
    S: AsyncRead + Unpin,
{
    let mut budget = HeadBudget::new(
        max_header_bytes,
        "upstream response headers exceed configured limit",
    )?;
    let mut raw = Vec::new();
    let mut line = Vec::new();

    let read =
        read_line_with_timeout(reader, &mut line, timeout_dur, peer, budget.remaining()).await?;
    if read == 0 {
        bail!("upstream closed connection before sending status line");
    }
    budget.record(read)?;
    raw.extend_from_slice(&line);
    let (status_code, status_text) = parse_status_line(&line_text(&line))?;

    let mut headers = Vec::new();
    let mut content_type = None;
    let mut content_length = None;
    let mut chunked = false;
    let mut transfer_encoding_present = false;

    loop {
        let remaining = budget.remaining();
        ensure!(remaining > 0, "upstream response headers exceed configured limit");
        let read = read_line_with_timeout(reader, &mut line, timeout_dur, peer, remaining).await?;
        if read == 0 {
            bail!("upstream closed connection during headers");
        }
        budget.record(read)?;
        raw.extend_from_slice(&line);
        let text = line_text(&line);
        if text.is_empty() {
            break;
        }
        let header = HeaderLine::parse(&text).context("invalid header from upstream")?;
        match header.lower_name() {
            "content-length" => {
                if content_length.is_some() {
                    bail!("multiple Content-Length headers from upstream are not supported");
                }
                let parsed: u64 = header
                    .value
                    .parse()
                    .with_context(|| format!("invalid Content-Length value '{}'", header.value))?;
                content_length = Some(parsed);
            }
            "transfer-encoding" => {
                transfer_encoding_present = true;
                if header.value.to_ascii_lowercase().contains("chunked") {
                    chunked = true;
                }
            }
            "content-type" => content_type = Some(header.value.clone()),
            _ => {}
        }
        headers.push(header);
    }

    if transfer_encoding_present && content_length.is_some() {
        warn!(
            peer = %peer,
            "upstream response contained both Transfer-Encoding and Content-Length; rejecting"
        );
        bail!("upstream response must not include both Transfer-Encoding and Content-Length");
    }

    Ok(UpstreamResponseHead {
        raw,
        status_code,
        status_text,
        headers,
        content_type,
        content_length,
        chunked,
    })
}

pub(crate) fn parse_status_line(value: &str) -> Result<(u16, String)> {
    let mut parts = value.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing HTTP version"))?;
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing status code"))?;
    let reason = parts.next().unwrap_or("").trim().to_string();

    ensure!(
        matches!(version, "HTTP/1.0" | "HTTP/1.1"),
        "unsupported upstream HTTP version '{version}'"
    );
    let status_code: u16 = status
        .parse()
        .with_context(|| format!("invalid upstream status code '{status}'"))?;
    ensure!(
        (100..1000).contains(&status_code),
        "unsupported upstream status code '{status_code}'"
    );
    Ok((status_code, reason))
}
