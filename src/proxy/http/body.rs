use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow, bail, ensure};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::proxy::cache::CacheWriter;
use crate::util::timeout_with_context;

const MAX_CHUNK_LINE_LENGTH: usize = 8192;
const RELAY_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
    UntilClose,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FrameState {
    SizeLine { line: Vec<u8> },
    Data { remaining: u64 },
    DataCr,
    DataLf,
    Trailer { line_len: usize },
    Done,
}

/// Follows chunked transfer framing across arbitrary read boundaries without
/// decoding it, so the encoded bytes can be relayed untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedFrameTracker {
    state: FrameState,
    payload_bytes: u64,
}

impl Default for ChunkedFrameTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedFrameTracker {
    pub fn new() -> Self {
        Self {
            state: FrameState::SizeLine { line: Vec::new() },
            payload_bytes: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == FrameState::Done
    }

    /// Decoded payload bytes seen so far.
    pub fn payload_bytes(&self) -> u64 {
        self.payload_bytes
    }

    /// Consumes `data` and returns how many of its bytes belong to the
    /// message. The count is shorter than `data` only when the terminating
    /// empty trailer line ends inside it.
    pub fn advance(&mut self, data: &[u8]) -> Result<usize> {
        let mut pos = 0;
        while pos < data.len() {
            match &mut self.state {
                FrameState::SizeLine { line } => {
                    let byte = data[pos];
                    pos += 1;
                    if byte != b'\n' {
                        ensure!(
                            line.len() < MAX_CHUNK_LINE_LENGTH,
                            "chunk size line exceeds {MAX_CHUNK_LINE_LENGTH} bytes"
                        );
                        line.push(byte);
                        continue;
                    }
                    let size = parse_chunk_size(line)?;
                    self.state = if size == 0 {
                        FrameState::Trailer { line_len: 0 }
                    } else {
                        FrameState::Data { remaining: size }
                    };
                }
                FrameState::Data { remaining } => {
                    let available = (data.len() - pos) as u64;
                    let take = available.min(*remaining);
                    *remaining -= take;
                    pos += take as usize;
                    self.payload_bytes = self.payload_bytes.saturating_add(take);
                    if *remaining == 0 {
                        self.state = FrameState::DataCr;
                    }
                }
                FrameState::DataCr => {
                    ensure!(data[pos] == b'\r', "invalid chunk terminator");
                    pos += 1;
                    self.state = FrameState::DataLf;
                }
                FrameState::DataLf => {
                    ensure!(data[pos] == b'\n', "invalid chunk terminator");
                    pos += 1;
                    self.state = FrameState::SizeLine { line: Vec::new() };
                }
                FrameState::Trailer { line_len } => {
                    let byte = data[pos];
                    pos += 1;
                    match byte {
                        b'\n' if *line_len == 0 => {
                            self.state = FrameState::Done;
                            return Ok(pos);
                        }
                        b'\n' => *line_len = 0,
                        b'\r' => {}
                        _ => {
                            *line_len += 1;
                            ensure!(
                                *line_len <= MAX_CHUNK_LINE_LENGTH,
                                "chunk trailer line exceeds {MAX_CHUNK_LINE_LENGTH} bytes"
                            );
                        }
                    }
                }
                FrameState::Done => return Ok(pos),
            }
        }
        Ok(pos)
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let text = std::str::from_utf8(line).map_err(|_| anyhow!("chunk size line is not ASCII"))?;
    let trimmed = text.trim_end_matches('\r');
    let size_str = trimmed
        .split_once(';')
        .map(|(size, _)| size)
        .unwrap_or(trimmed)
        .trim();
    ensure!(!size_str.is_empty(), "empty chunk size line");
    u64::from_str_radix(size_str, 16).map_err(|_| anyhow!("invalid chunk size '{size_str}'"))
}

pub struct RelayTimeouts {
    pub upstream: Duration,
    pub client: Duration,
}

/// Copies the response body to the client, feeding each piece to `cache`
/// after the client write succeeds. Returns body bytes relayed.
pub async fn relay_body<U, C>(
    upstream: &mut BufReader<U>,
    client: &mut C,
    plan: BodyPlan,
    mut cache: Option<&mut CacheWriter>,
    timeouts: &RelayTimeouts,
    upstream_peer: SocketAddr,
) -> Result<u64>
where
    U: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    let mut remaining = match plan {
        BodyPlan::Empty => return Ok(0),
        BodyPlan::Fixed(length) => Some(length),
        BodyPlan::Chunked | BodyPlan::UntilClose => None,
    };
    let mut tracker = matches!(plan, BodyPlan::Chunked).then(ChunkedFrameTracker::new);
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    let mut relayed = 0u64;

    loop {
        if remaining == Some(0) || tracker.as_ref().is_some_and(ChunkedFrameTracker::is_done) {
            break;
        }
        let limit = remaining
            .map(|left| left.min(buffer.len() as u64) as usize)
            .unwrap_or(buffer.len());
        let read = timeout_with_context(
            timeouts.upstream,
            upstream.read(&mut buffer[..limit]),
            format!("reading response body from {upstream_peer}"),
        )
        .await?;
        if read == 0 {
            match plan {
                BodyPlan::UntilClose => break,
                _ => bail!("upstream {upstream_peer} closed before end of response body"),
            }
        }

        let piece = match tracker.as_mut() {
            Some(tracker) => {
                let used = tracker.advance(&buffer[..read])?;
                &buffer[..used]
            }
            None => &buffer[..read],
        };
        if let Some(left) = remaining.as_mut() {
            *left -= piece.len() as u64;
        }

        timeout_with_context(
            timeouts.client,
            client.write_all(piece),
            "writing response body to client",
        )
        .await?;
        relayed = relayed.saturating_add(piece.len() as u64);
        if let Some(writer) = cache.as_deref_mut() {
            writer.push(piece);
        }
    }

    timeout_with_context(timeouts.client, client.flush(), "flushing response to client").await?;
    Ok(relayed)
}
