// =============================================================================
// Vela Futures Engine — Main Entry Point
// =============================================================================
//
// Startup order matters: the journal opens before anything can trade, the
// reconciler runs its startup pass before the first scan tick, and every
// long-running subsystem shares one shutdown channel. SIGINT/SIGTERM begin a
// cooperative drain; fatal conditions (bad credentials, unwritable journal,
// unrecoverable clock drift) halt the process with their own exit codes.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod app_state;
mod binance;
mod breaker;
mod config;
mod engine;
mod error;
mod jitter;
mod limiter;
mod market_data;
mod notifier;
mod oracle;
mod positions;
mod reconciler;
mod safestop;
mod striker;
mod types;
mod wal;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::binance::VenueClient;
use crate::config::CoreConfig;
use crate::error::VenueError;
use crate::limiter::{RateLimiter, WEIGHT_CAP_PER_MIN};
use crate::market_data::{CandleBuffer, StreamManager, StreamSettings};
use crate::notifier::{run_dispatcher, LogSink, NotifyHandle, Severity};
use crate::oracle::{DecisionOracle, LocalOracle, OracleRouter};
use crate::striker::Striker;
use crate::wal::Wal;

/// Cadence of the venue server-time resync.
const TIME_SYNC_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> ExitCode {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Vela Futures Engine — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = CoreConfig::load("vela_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        CoreConfig::default()
    });
    config.apply_env_overrides();

    info!(
        symbols = ?config.symbols,
        intervals = ?config.kline_intervals,
        scan_interval_secs = config.scan_interval_secs,
        "configured universe"
    );

    // ── 2. Notifier ──────────────────────────────────────────────────────
    let (notify_handle, notify_rx) = NotifyHandle::channel();
    tokio::spawn(run_dispatcher(notify_rx, Box::new(LogSink)));

    // ── 3. Journal (must be writable before anything trades) ─────────────
    let wal = match Wal::open(&config.wal_path, config.wal_rotate_bytes) {
        Ok(w) => Arc::new(w),
        Err(e) => {
            error!(path = %config.wal_path, error = %e, "journal unwritable, refusing to start");
            return ExitCode::from(error::FatalKind::Journal.exit_code());
        }
    };

    // ── 4. Shutdown channel & journal flush task ─────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(wal::run_flush_task(
        wal.clone(),
        config.wal_flush_ms,
        shutdown_rx.clone(),
    ));

    // ── 5. Venue client ──────────────────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    if api_key.is_empty() || api_secret.is_empty() {
        warn!("BINANCE_API_KEY / BINANCE_API_SECRET not set, signed calls will fail");
    }

    let limiter = Arc::new(RateLimiter::new(
        WEIGHT_CAP_PER_MIN,
        config.rate_limit_soft_ratio,
    ));
    let client = Arc::new(VenueClient::new(
        api_key,
        api_secret,
        limiter.clone(),
        config.clock_drift_limit_ms,
        config.recv_window_ms,
    ));

    if let Err(e) = client.sync_time().await {
        warn!(error = %e, "initial server-time sync failed, continuing with local clock");
    }

    // ── 6. Shared state ──────────────────────────────────────────────────
    let candles = Arc::new(CandleBuffer::new(500));
    let app = Arc::new(AppState::new(
        config.clone(),
        wal.clone(),
        client.clone(),
        limiter,
        candles.clone(),
        notify_handle.clone(),
    ));

    // ── 7. Market data stream ────────────────────────────────────────────
    let stream = Arc::new(StreamManager::new(
        StreamSettings {
            symbols: config.symbols.clone(),
            intervals: config.kline_intervals.clone(),
            ..Default::default()
        },
        candles.clone(),
    ));
    tokio::spawn(stream.clone().run(shutdown_rx.clone()));

    // ── 8. Periodic server-time resync ───────────────────────────────────
    tokio::spawn(run_time_sync(app.clone(), shutdown_rx.clone()));

    // ── 9. Reconciler, position monitor, safe-stop monitor ───────────────
    tokio::spawn(reconciler::run_reconciler_loop(
        app.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(positions::run_position_monitor(
        app.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(safestop::run_safe_stop_monitor(
        app.clone(),
        shutdown_rx.clone(),
    ));

    // ── 10. Oracle, striker, engine loop ─────────────────────────────────
    let oracle: Arc<dyn DecisionOracle> =
        Arc::new(OracleRouter::new(vec![Arc::new(LocalOracle::default())]));
    let striker = Arc::new(Striker::new(app.clone()));
    let mut engine_handle = tokio::spawn(engine::run_engine_loop(
        app.clone(),
        oracle,
        striker,
        shutdown_rx.clone(),
    ));

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 11. Wait for a shutdown cause ────────────────────────────────────
    let mut exit = ExitCode::SUCCESS;
    let mut engine_done = false;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("SIGINT received, shutting down gracefully");
        }
        _ = terminate_signal() => {
            warn!("SIGTERM received, shutting down gracefully");
        }
        fatal = app.fatal_signalled() => {
            let (kind, reason) = fatal;
            error!(kind = %kind, reason = %reason, "fatal condition, halting");
            notify_handle.notify(
                Severity::Critical,
                format!("engine halting ({kind}): {reason}"),
                &["fatal"],
            );
            exit = ExitCode::from(kind.exit_code());
        }
        res = &mut engine_handle => {
            engine_done = true;
            match res {
                Ok(Ok(())) => info!("engine loop ended"),
                Ok(Err(e)) => {
                    error!(error = %e, "engine loop failed");
                    exit = app
                        .fatal_condition()
                        .map(|(kind, _)| ExitCode::from(kind.exit_code()))
                        .unwrap_or(ExitCode::FAILURE);
                }
                Err(e) => {
                    error!(error = %e, "engine task aborted");
                    exit = ExitCode::FAILURE;
                }
            }
        }
    }

    // ── 12. Cooperative drain ────────────────────────────────────────────
    let _ = shutdown_tx.send(true);

    if !engine_done {
        let drain = Duration::from_secs(config.shutdown_drain_secs.max(1));
        match tokio::time::timeout(drain, &mut engine_handle).await {
            Ok(_) => info!("in-flight work drained"),
            Err(_) => warn!(
                deadline_secs = drain.as_secs(),
                "drain deadline hit, abandoning tasks"
            ),
        }
    }

    if let Err(e) = wal.close() {
        error!(error = %e, "journal close failed");
    }

    info!("vela engine shut down complete");
    exit
}

/// Resync the venue server-time offset on a fixed cadence. A detected drift
/// blocks signed calls; the immediate follow-up sync re-baselines the offset
/// and unblocks them, per the clock-discipline policy in the venue client.
async fn run_time_sync(app: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(TIME_SYNC_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }

        match app.client.sync_time().await {
            Ok(()) => {}
            Err(e @ VenueError::ClockDrift { .. }) => {
                warn!(error = %e, "clock drift detected, re-baselining");
                app.notifier.notify(
                    Severity::Critical,
                    format!("clock drift: {e}, signed calls paused for resync"),
                    &["clock"],
                );
                // Second sync re-baselines and unblocks signed calls.
                tokio::time::sleep(Duration::from_secs(2)).await;
                if let Err(e2) = app.client.sync_time().await {
                    warn!(error = %e2, "clock resync failed, retrying next cycle");
                }
            }
            Err(e) => {
                warn!(error = %e, "server-time sync failed");
            }
        }
    }
}

/// Resolve on SIGTERM (unix); never resolves elsewhere.
async fn terminate_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}
