use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Days, Utc};
use tokio::time::MissedTickBehavior;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use driver_dispatch::config::Config;
use driver_dispatch::observability::logging::init_tracing;
use driver_dispatch::store::InMemoryRepository;
use driver_dispatch::{DispatchEngine, DispatchError};

#[tokio::main]
async fn main() -> Result<(), DispatchError> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let engine = DispatchEngine::builder(Arc::new(InMemoryRepository::new()))
        .config(config.dispatch.clone())
        .event_buffer_size(config.event_buffer_size)
        .build()?;

    tokio::spawn(log_events(engine.clone()));
    tokio::spawn(run_daily_reset(engine.clone()));
    tokio::spawn(run_on_time_refresh(
        engine.clone(),
        config.on_time_refresh_minutes,
    ));

    info!(
        auto_break = config.dispatch.auto_break_on_threshold,
        refresh_minutes = config.on_time_refresh_minutes,
        "dispatch core started"
    );

    shutdown_signal().await;
    info!("dispatch core stopped");
    Ok(())
}

async fn log_events(engine: Arc<DispatchEngine>) {
    let mut events = engine.events().stream();
    while let Some(item) = events.next().await {
        match item {
            Ok(event) => info!(
                event = event.kind().as_str(),
                driver_id = %event.driver_id(),
                "dispatch event"
            ),
            Err(err) => warn!(error = %err, "event stream lagged"),
        }
    }
}

async fn run_daily_reset(engine: Arc<DispatchEngine>) {
    loop {
        tokio::time::sleep(until_next_utc_midnight()).await;

        let engine = engine.clone();
        match tokio::task::spawn_blocking(move || engine.reset_daily_metrics()).await {
            Ok(report) if report.failed.is_empty() => {}
            Ok(report) => warn!(failed = ?report.failed, "daily reset left drivers untouched"),
            Err(err) => error!(error = %err, "daily reset task failed"),
        }
    }
}

async fn run_on_time_refresh(engine: Arc<DispatchEngine>, minutes: u64) {
    let mut ticker = tokio::time::interval(StdDuration::from_secs(minutes.saturating_mul(60)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let engine = engine.clone();
        let refreshed = tokio::task::spawn_blocking(move || {
            let mut failed = 0usize;
            for driver in engine.list_drivers() {
                if let Err(err) = engine.update_on_time_rate(driver.id) {
                    warn!(driver_id = %driver.id, error = %err, "on-time rate refresh failed");
                    failed += 1;
                }
            }
            failed
        })
        .await;

        match refreshed {
            Ok(0) => {}
            Ok(failed) => warn!(failed, "on-time refresh skipped drivers"),
            Err(err) => error!(error = %err, "on-time refresh task failed"),
        }
    }
}

fn until_next_utc_midnight() -> StdDuration {
    let now = Utc::now();
    now.date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|midnight| (midnight.and_utc() - now).to_std().ok())
        .unwrap_or(StdDuration::from_secs(24 * 60 * 60))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
}
