pub mod cache;
pub mod http;
pub mod listener;

use anyhow::Result;
use std::sync::Arc;

use crate::settings::Settings;

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub cache: Option<cache::ResponseCache>,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, cache: Option<cache::ResponseCache>) -> Self {
        Self { settings, cache }
    }

    /// Builds the shared cache from settings, or none when caching is off.
    pub fn from_settings(settings: Arc<Settings>) -> Self {
        let cache = settings.cache_enabled.then(|| {
            cache::ResponseCache::with_capacity_megabytes(settings.cache_max_size_mb)
                .with_max_key_length(settings.cache_max_key_length)
                .with_unbounded_responses(settings.cache_unbounded_responses)
        });
        Self::new(settings, cache)
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
