// Unattended perpetual futures trading agent.
//
// Wiring: one scheduler task drives the trade cycle, the health monitor
// watches its heartbeat and respawns it when it stalls, and a small
// HTTP server exposes health and status for the process guardian.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};

use perpbot::advisor::{AdvisorClient, DecisionPipeline};
use perpbot::config::Settings;
use perpbot::exchange::{Exchange, OkxClient};
use perpbot::execution::{ExecutionEngine, PositionCache};
use perpbot::monitor::HealthMonitor;
use perpbot::ratelimit::ApiRateLimiter;
use perpbot::scheduler::TradingScheduler;
use perpbot::server;
use perpbot::state::SharedState;

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "perpbot=info".into()),
        )
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let settings = Settings::load().context("loading configuration")?;
    if let Err(errors) = settings.validate() {
        for problem in &errors {
            error!("config: {}", problem);
        }
        anyhow::bail!("configuration invalid ({} problems)", errors.len());
    }

    info!("perpbot {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "instrument {}  timeframe {}  margin {:.0} USDT at {:.0}x leverage",
        settings.trade.symbol,
        settings.trade.timeframe,
        settings.trade.margin_usdt,
        settings.trade.leverage
    );
    if settings.trade.test_mode {
        warn!("TEST MODE: decisions are logged, no orders are placed");
    } else {
        warn!("LIVE TRADING: real orders will be placed");
    }
    if settings.exchange.sandbox {
        info!("exchange demo-trading venue enabled");
    }

    let limiter = Arc::new(ApiRateLimiter::new());
    let exchange: Arc<dyn Exchange> =
        Arc::new(OkxClient::new(&settings.exchange, limiter.clone())?);
    let cache = PositionCache::new(exchange.clone(), settings.trade.symbol.clone());
    let engine = Arc::new(ExecutionEngine::new(
        exchange.clone(),
        cache.clone(),
        settings.trade.clone(),
    ));
    let pipeline = Arc::new(DecisionPipeline::new(AdvisorClient::new(&settings.advisor)?));
    let state = Arc::new(SharedState::new());

    let scheduler = Arc::new(TradingScheduler::new(
        settings.trade.clone(),
        exchange,
        engine,
        pipeline,
        cache,
        state.clone(),
        limiter,
    ));

    let server_settings = settings.server.clone();
    let monitor_settings = settings.monitor.clone();
    let server_state = state.clone();
    tokio::spawn(async move {
        if let Err(err) = server::run(server_settings, &monitor_settings, server_state).await {
            error!("health server exited: {}", err);
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = HealthMonitor::new(settings.monitor.clone(), state.clone());
    let spawn_scheduler = {
        let scheduler = scheduler.clone();
        move |cancel: watch::Receiver<bool>| {
            let scheduler = scheduler.clone();
            tokio::spawn(scheduler.run(cancel))
        }
    };

    let mut monitor_task =
        tokio::spawn(async move { monitor.run(spawn_scheduler, shutdown_rx).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, stopping");
            let _ = shutdown_tx.send(true);
            if tokio::time::timeout(Duration::from_secs(15), &mut monitor_task)
                .await
                .is_err()
            {
                warn!("monitor did not stop in time, aborting");
                monitor_task.abort();
            }
        }
        result = &mut monitor_task => {
            match result {
                Ok(()) => warn!("health monitor exited on its own"),
                Err(err) => error!("health monitor task failed: {}", err),
            }
        }
    }

    info!("perpbot stopped");
    Ok(())
}
