use super::CacheError;

/// Default upper bound on host and path length, in bytes.
pub const DEFAULT_MAX_KEY_LENGTH: usize = 2048;

/// Exact (host, path) pair a response is cached under.
///
/// Keys are compared byte for byte; no normalization is applied. Oversized
/// components are rejected rather than truncated so that two distinct long
/// URLs can never alias the same entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    host: String,
    path: String,
}

impl CacheKey {
    pub fn new(host: &str, path: &str, max_len: usize) -> Result<Self, CacheError> {
        check_len("host", host, max_len)?;
        check_len("path", path, max_len)?;
        Ok(Self {
            host: host.to_string(),
            path: path.to_string(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn matches(&self, host: &str, path: &str) -> bool {
        self.host == host && self.path == path
    }
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), CacheError> {
    if value.len() > max {
        return Err(CacheError::MalformedKey {
            field,
            len: value.len(),
            max,
        });
    }
    Ok(())
}
