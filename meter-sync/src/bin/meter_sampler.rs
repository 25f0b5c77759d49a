use anyhow::Result;
use meter_sync::{clock::SystemClock, config::AppConfig, metrics_server, observability, sampler::Sampler};

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                if ctrl_c.await.is_ok() {
                    tracing::info!("received SIGINT, shutting down");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if ctrl_c.await.is_ok() {
            tracing::info!("received SIGINT, shutting down");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;
    let site = cfg.site()?;
    let sampler_cfg = cfg.sampler()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    tracing::info!(
        site = %site.site_id,
        data_dir = %site.data_dir.display(),
        primary = %sampler_cfg.primary_url,
        production = ?sampler_cfg.production_url,
        "starting meter sampler"
    );

    let sampler = Sampler::from_config(site, sampler_cfg, SystemClock)?;
    let summary = sampler.run(shutdown_signal()).await?;

    tracing::info!(
        ticks = summary.ticks,
        failed_reads = summary.failed_reads,
        windows = summary.flush.windows,
        flush_failures = summary.flush.failures,
        "meter sampler exited"
    );
    Ok(())
}
