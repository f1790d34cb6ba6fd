mod polling;

use crate::core::settings::{Settings, API_KEY_VAR};
use crate::providers::{ElectricityMapsClient, IntensitySource};
use anyhow::Result;
use std::sync::Arc;

pub use polling::{CycleOutcome, Poller};

pub async fn run(settings: Settings, once: bool) -> Result<()> {
    tracing::info!("Starting carbon-poller");
    if let Err(e) = settings.validate() {
        tracing::error!(error = %e, "Invalid configuration, polling disabled");
        return Ok(());
    }

    let Some(api_key) = settings.api_key() else {
        tracing::error!(var = API_KEY_VAR, "API key not set, polling disabled");
        return Ok(());
    };

    let client = ElectricityMapsClient::new(api_key, &settings.api.base_url)?;
    tracing::info!(
        source = client.name(),
        interval_minutes = settings.poll.interval_minutes,
        ttl_minutes = settings.cache.ttl_minutes,
        cache_file = ?settings.cache.file,
        zones = ?settings.poll.zones,
        "Poller configured"
    );

    let mut poller = Poller::from_settings(Arc::new(client), &settings);
    poller.log_cache_state();

    if once {
        return match poller.run_cycle().await? {
            CycleOutcome::NoData => anyhow::bail!("No zone returned carbon intensity data"),
            outcome => {
                tracing::info!(?outcome, "Single cycle complete");
                Ok(())
            }
        };
    }

    poller.run(shutdown_signal()).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received");
}
