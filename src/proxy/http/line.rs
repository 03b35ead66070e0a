use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow, bail, ensure};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::util::timeout_with_context;

/// Reads one line, terminator included, into `buf` as raw bytes.
///
/// Returns 0 on a clean EOF before any byte of the line. Header bytes are
/// kept verbatim because upstream heads are relayed and cached as received.
pub(crate) async fn read_line_with_timeout<S>(
    reader: &mut BufReader<S>,
    buf: &mut Vec<u8>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    buf.clear();

    loop {
        let available = timeout_with_context(
            timeout_dur,
            reader.fill_buf(),
            format!("reading line from {peer}"),
        )
        .await?;

        if available.is_empty() {
            if buf.is_empty() {
                return Ok(0);
            }
            bail!("connection closed while reading line from {peer}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if buf
            .len()
            .checked_add(consume)
            .ok_or_else(|| anyhow!("line length overflow for {peer}"))?
            > max_len
        {
            bail!("line from {peer} exceeds configured limit of {max_len} bytes");
        }

        buf.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            return Ok(buf.len());
        }
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|byte| *byte != b'\r' && *byte != b'\n')
        .map(|idx| idx + 1)
        .unwrap_or(0);
    &line[..end]
}

/// Strips the trailing CRLF (or bare LF) and decodes the line as text.
pub(crate) fn line_text(line: &[u8]) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(trim_line_end(line))
}

/// Like [`line_text`] but refuses invalid UTF-8. Request lines feed the cache
/// key, so two distinct byte strings must never decode to the same text.
pub(crate) fn line_str(line: &[u8]) -> Result<&str, std::str::Utf8Error> {
    std::str::from_utf8(trim_line_end(line))
}

/// Remaining header budget for one message head.
pub(crate) struct HeadBudget {
    limit: usize,
    used: usize,
    error_message: &'static str,
}

impl HeadBudget {
    pub fn new(limit: usize, error_message: &'static str) -> Result<Self> {
        ensure!(limit > 0, "header limit must be greater than zero");
        Ok(Self {
            limit,
            used: 0,
            error_message,
        })
    }

    pub fn record(&mut self, bytes: usize) -> Result<()> {
        self.used = self
            .used
            .checked_add(bytes)
            .ok_or_else(|| anyhow!("header size overflow"))?;
        ensure!(self.used <= self.limit, "{}", self.error_message);
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[tokio::test]
    async fn reads_lines_verbatim_with_terminators() -> Result<()> {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"GET / HTTP/1.1\r\nHost: a\n").await?;
        drop(tx);

        let mut reader = BufReader::new(rx);
        let mut buf = Vec::new();
        let timeout = Duration::from_secs(1);
        assert_eq!(read_line_with_timeout(&mut reader, &mut buf, timeout, peer(), 64).await?, 16);
        assert_eq!(buf, b"GET / HTTP/1.1\r\n");
        read_line_with_timeout(&mut reader, &mut buf, timeout, peer(), 64).await?;
        assert_eq!(buf, b"Host: a\n");
        assert_eq!(read_line_with_timeout(&mut reader, &mut buf, timeout, peer(), 64).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn rejects_line_over_limit() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"0123456789\r\n").await.unwrap();
        let mut reader = BufReader::new(rx);
        let mut buf = Vec::new();
        let err = read_line_with_timeout(&mut reader, &mut buf, Duration::from_secs(1), peer(), 8)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds configured limit"));
    }

    #[tokio::test]
    async fn eof_mid_line_is_an_error() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"partial").await.unwrap();
        drop(tx);
        let mut reader = BufReader::new(rx);
        let mut buf = Vec::new();
        let result =
            read_line_with_timeout(&mut reader, &mut buf, Duration::from_secs(1), peer(), 64).await;
        assert!(result.is_err());
    }

    #[test]
    fn line_text_drops_terminator() {
        assert_eq!(line_text(b"Host: a\r\n"), "Host: a");
        assert_eq!(line_text(b"\r\n"), "");
        assert_eq!(line_text(b"bare"), "bare");
    }

    #[test]
    fn line_str_refuses_invalid_utf8() {
        assert_eq!(line_str(b"GET /a HTTP/1.1\r\n").unwrap(), "GET /a HTTP/1.1");
        assert!(line_str(b"GET /\xff HTTP/1.1\r\n").is_err());
        assert!(line_str(b"GET /\xfe HTTP/1.1\r\n").is_err());
    }

    #[test]
    fn head_budget_enforces_limit() {
        let mut budget = HeadBudget::new(10, "too big").unwrap();
        budget.record(6).unwrap();
        assert_eq!(budget.remaining(), 4);
        assert!(budget.record(5).is_err());
    }
}
