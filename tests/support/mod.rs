#![allow(dead_code)]

mod http_utils;
mod net;
mod upstream;

pub use http_utils::*;
pub use net::*;
pub use upstream::*;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use cacheproxy::{
    cli::LogFormat,
    proxy::{AppContext, cache::ResponseCache, listener},
    settings::Settings,
};

pub fn default_test_settings(listen: SocketAddr) -> Settings {
    Settings {
        listen,
        log: LogFormat::Text,
        max_connections: 0,
        cache_enabled: true,
        cache_max_size_mb: 4,
        cache_unbounded_responses: true,
        cache_max_key_length: 2048,
        client_timeout: 5,
        upstream_connect_timeout: 2,
        upstream_timeout: 5,
        max_header_size: 32 * 1024,
        metrics_listen: None,
    }
}

pub struct ProxyHarness {
    pub addr: SocketAddr,
    pub settings: Arc<Settings>,
    pub cache: Option<ResponseCache>,
    handle: JoinHandle<()>,
}

impl ProxyHarness {
    pub async fn connect(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.addr).await?)
    }

    pub fn cache(&self) -> &ResponseCache {
        self.cache.as_ref().expect("cache enabled in harness")
    }

    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

#[derive(Default)]
pub struct ProxyHarnessBuilder {
    settings_override: Option<Box<dyn FnOnce(&mut Settings) + Send>>,
    cache: Option<ResponseCache>,
}

impl ProxyHarnessBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings<F>(mut self, func: F) -> Self
    where
        F: FnOnce(&mut Settings) + Send + 'static,
    {
        self.settings_override = Some(Box::new(func));
        self
    }

    /// Uses a prebuilt cache instead of one derived from settings.
    pub fn with_cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub async fn spawn(mut self) -> Result<ProxyHarness> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;

        let mut settings = default_test_settings(addr);
        if let Some(override_fn) = self.settings_override.take() {
            override_fn(&mut settings);
        }
        let settings = Arc::new(settings);

        let app = match self.cache.take() {
            Some(cache) => AppContext::new(settings.clone(), Some(cache)),
            None => AppContext::from_settings(settings.clone()),
        };
        let cache = app.cache.clone();

        let handle = tokio::spawn(async move {
            if let Err(err) = listener::serve(listener, app).await {
                tracing::error!(error = ?err, "proxy listener failed");
            }
        });

        Ok(ProxyHarness {
            addr,
            settings,
            cache,
            handle,
        })
    }
}
