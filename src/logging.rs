use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use http::StatusCode;
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;
use crate::proxy::cache::CacheStoreOutcome;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

/// How a request met the cache on the way in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Hit,
    Miss,
    /// Cache disabled, or the request carried client-specific headers.
    Bypass,
}

impl CacheLookup {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLookup::Hit => "hit",
            CacheLookup::Miss => "miss",
            CacheLookup::Bypass => "bypass",
        }
    }
}

/// Everything the cache did for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheActivity {
    pub lookup: Option<CacheLookup>,
    pub store: Option<CacheStoreOutcome>,
    /// Size of the entry served on a hit, or stored on a miss.
    pub entry_bytes: Option<u64>,
    /// Bytes evicted from other entries to admit this response.
    pub evicted_bytes: Option<u64>,
}

/// One line per proxied request.
#[derive(Debug, Clone)]
pub struct AccessLogEvent {
    pub client: SocketAddr,
    pub method: String,
    pub host: String,
    pub path: String,
    pub cache: CacheActivity,
    pub status: u16,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub elapsed: Duration,
    pub upstream_addr: Option<String>,
    pub error_reason: Option<&'static str>,
    pub error_detail: Option<String>,
}

#[derive(Debug)]
pub struct AccessLogBuilder {
    event: AccessLogEvent,
}

impl AccessLogBuilder {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            event: AccessLogEvent {
                client: peer,
                method: String::new(),
                host: String::new(),
                path: String::new(),
                cache: CacheActivity::default(),
                status: 0,
                bytes_in: 0,
                bytes_out: 0,
                elapsed: Duration::ZERO,
                upstream_addr: None,
                error_reason: None,
                error_detail: None,
            },
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.event.method = method.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.event.host = host.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.event.path = path.into();
        self
    }

    pub fn cache_lookup(mut self, lookup: CacheLookup) -> Self {
        self.event.cache.lookup = Some(lookup);
        self
    }

    pub fn cache_hit(mut self, entry_bytes: u64) -> Self {
        self.event.cache.lookup = Some(CacheLookup::Hit);
        self.event.cache.entry_bytes = Some(entry_bytes);
        self
    }

    /// Records how the response was handed to the cache. `entry_bytes` is
    /// only kept when the entry was actually stored.
    pub fn cache_store(
        mut self,
        outcome: CacheStoreOutcome,
        entry_bytes: u64,
        evicted_bytes: u64,
    ) -> Self {
        self.event.cache.store = Some(outcome);
        if outcome == CacheStoreOutcome::Stored {
            self.event.cache.entry_bytes = Some(entry_bytes);
        }
        if evicted_bytes > 0 {
            self.event.cache.evicted_bytes = Some(evicted_bytes);
        }
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.event.status = status.as_u16();
        self
    }

    pub fn bytes_in(mut self, bytes: u64) -> Self {
        self.event.bytes_in = bytes;
        self
    }

    pub fn bytes_out(mut self, bytes: u64) -> Self {
        self.event.bytes_out = bytes;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed = elapsed;
        self
    }

    pub fn upstream_addr(mut self, addr: impl Into<String>) -> Self {
        self.event.upstream_addr = Some(addr.into());
        self
    }

    pub fn error_reason(mut self, reason: &'static str) -> Self {
        self.event.error_reason = Some(reason);
        self
    }

    pub fn error_detail(mut self, detail: impl Into<String>) -> Self {
        self.event.error_detail = Some(detail.into());
        self
    }

    pub fn build(self) -> AccessLogEvent {
        self.event
    }

    pub fn log(self) {
        log_access(self.build());
    }
}

/// UTC timestamp with millisecond precision, e.g. `2024-05-01T08:09:10.042Z`.
fn access_timestamp(now: OffsetDateTime) -> String {
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    format!(
        "{year:04}-{:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{:03}Z",
        u8::from(month),
        now.millisecond()
    )
}

pub fn log_access(event: AccessLogEvent) {
    let AccessLogEvent {
        client,
        method,
        host,
        path,
        cache,
        status,
        bytes_in,
        bytes_out,
        elapsed,
        upstream_addr,
        error_reason,
        error_detail,
    } = event;

    tracing::info!(
        target = "access_log",
        ts = access_timestamp(OffsetDateTime::now_utc()),
        client_ip = %client.ip(),
        client_port = client.port(),
        method,
        host,
        path,
        status,
        cache_lookup = cache.lookup.as_ref().map(CacheLookup::as_str),
        cache_store = cache.store.as_ref().map(CacheStoreOutcome::as_str),
        cache_entry_bytes = cache.entry_bytes,
        cache_evicted_bytes = cache.evicted_bytes,
        bytes_in,
        bytes_out,
        elapsed_ms = elapsed.as_millis() as u64,
        upstream_addr = upstream_addr.as_deref(),
        error_reason,
        error_detail = error_detail.as_deref()
    );

    crate::metrics::record_request(
        &method,
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        elapsed,
    );
}
