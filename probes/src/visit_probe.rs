use anyhow::Result;
use std::sync::Arc;
use tokio::signal;

use lib_tractstack::{EngagementSignal, FileStore, VisitorRuntime};
use probes::probe_logic::{config, logger};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let config = config::load_config()?;
    logger::setup_logging(&config.log_dir, &config.log_level, "visit_probe")?;

    log::info!(
        "Visiting {} (tenant '{}', storyfragment '{}')",
        config.client.backend_url(),
        config.client.tenant_id(),
        config.client.storyfragment_id()
    );

    let store = Arc::new(FileStore::new(config.store_path.clone()));
    let runtime = VisitorRuntime::new(config.client.clone(), store)?;

    let signals = runtime.start(config.regions.clone()).await;
    let session = runtime.session();
    log::info!("Session {:?} ready", session.session_id);

    // Every configured region is in view for the whole visit.
    let entered_at = lib_tractstack::utils::now_ms();
    for region_id in &config.regions {
        let _ = signals.send(EngagementSignal::Visibility {
            region_id: region_id.clone(),
            ratio: 1.0,
            at: entered_at,
        });
    }

    let mut events = runtime.channel().subscribe();
    let event_logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let panes = event.pane_ids();
                    if panes.is_empty() {
                        log::info!("Realtime event '{}': {}", event.name, event.payload);
                    } else {
                        log::info!("Realtime event '{}' invalidates panes {:?}", event.name, panes);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Realtime event logger lagged; {} events skipped", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, leaving the page.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, leaving the page.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    // Final flush is delivered before the process exits.
    runtime.shutdown().await;
    event_logger.abort();

    log::info!("Visit complete.");
    Ok(())
}
