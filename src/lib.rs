pub mod cli;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::Result;

use crate::settings::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    if let Some(addr) = settings.metrics_listen {
        let path = "/metrics".to_string();
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr, path).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let app = proxy::AppContext::from_settings(settings);
    if let Some(cache) = &app.cache {
        tracing::info!(
            capacity_bytes = cache.capacity_bytes(),
            unbounded_responses = cache.caches_unbounded_responses(),
            "response cache enabled"
        );
    }
    proxy::run(app).await
}
