use std::sync::Arc;

use tokio::sync::watch;

use beacon_duty_watch_core::config::{Settings, WatcherRuntime};
use beacon_duty_watch_core::emitter::{EventEmitter, LogNotifier, NoopNotifier, Notifier};
use beacon_duty_watch_core::scheduler::Scheduler;
use beacon_duty_watch_core::tracing as tracing_config;
use beacon_duty_watch_service_lib::common::AppState;
use beacon_duty_watch_service_lib::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let settings = Settings::from_env()?;
    tracing_config::init(&settings.log_format);
    tracing::info!(settings = ?settings, "Configuration");

    let runtime = WatcherRuntime::init(settings)?;
    let head = runtime.probe_beacon().await?;
    tracing::info!(head, "Beacon node reachable");

    let state = Arc::new(AppState::new(Arc::clone(&runtime.metrics))?);
    let _server = server::launch(Arc::clone(&state));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {e:?}");
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let notifier = if runtime.settings.test_mode {
        tracing::warn!("TEST_MODE is set, events will not be delivered");
        Notifier::Noop(NoopNotifier)
    } else {
        Notifier::Log(LogNotifier)
    };
    let emitter = EventEmitter::new(
        notifier,
        runtime.settings.notification_rate_limit,
        Some(runtime.metrics.watcher.events_total.clone()),
    );

    let scheduler = Scheduler::new(
        runtime.settings.scheduler.clone(),
        Arc::clone(&runtime.client),
        runtime.monitored.clone(),
        emitter,
        runtime.cursor,
        runtime.mev.clone(),
        Arc::clone(&runtime.metrics),
        shutdown_rx,
    );
    scheduler.run().await;

    Ok(())
}
