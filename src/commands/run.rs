//! Trading loop command
//!
//! Drives the state machine once per tick against a paper account priced by
//! the public quotation API, forwarding events to the configured notifier.

use anyhow::{Context, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use vbs_trader::clock::SystemClock;
use vbs_trader::exchange::PaperExchange;
use vbs_trader::notify::format_krw;
use vbs_trader::state_manager::JsonStateStore;
use vbs_trader::trader::Trader;

pub fn run(config_path: String, state_file: Option<String>) -> Result<()> {
    super::runtime()?.block_on(run_async(config_path, state_file))
}

async fn run_async(config_path: String, state_file: Option<String>) -> Result<()> {
    let mut config = super::load_config(&config_path)?;
    if let Some(path) = state_file {
        config.trading.state_file = path;
    }

    let settings = config.trader_settings()?;
    let reset = settings.reset;

    info!("════════════════════════════════════════════════════════════");
    info!("  VOLATILITY BREAKOUT TRADER - PAPER MODE");
    info!("  Ticker:      {} ({})", settings.ticker, settings.interval);
    info!("  Scope:       {}", settings.scope);
    info!("  Capital:     {} {}", format_krw(config.exchange.paper_capital), settings.quote_currency);
    info!("  State file:  {}", config.trading.state_file);
    info!("════════════════════════════════════════════════════════════");

    let market = Arc::new(super::market_client(&config)?);
    let exchange = PaperExchange::new(
        Arc::clone(&market),
        settings.quote_currency.clone(),
        config.exchange.paper_capital,
        config.exchange.fee_rate,
    );
    let notifier = super::notifier(&config, reset)?;
    let store = JsonStateStore::new(&config.trading.state_file, reset);

    let mut trader = Trader::new(settings, exchange, market, SystemClock, store)
        .await
        .context("Failed to start trader")?;
    notifier.status(trader.state()).await;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let mut shutdown_rx = spawn_shutdown_listener(tokio::signal::ctrl_c(), shutdown_flag.clone());

    let mut tick = interval(Duration::from_secs(config.trading.tick_seconds));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_alert: Option<String> = None;

    info!("Starting trading loop...");

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if shutdown_flag.load(Ordering::SeqCst) {
                    break;
                }

                match trader.tick().await {
                    Ok(Some(event)) => {
                        last_alert = None;
                        notifier.notify(&event).await;
                    }
                    Ok(None) => {}
                    Err(e) if e.is_invariant_violation() => {
                        error!("Invariant violation: {}", e);
                        let message = e.to_string();
                        // Alert once per distinct violation, the tick repeats every second
                        if last_alert.as_deref() != Some(message.as_str()) {
                            notifier.alert(&message).await;
                            last_alert = Some(message);
                        }
                    }
                    Err(e) => warn!("Tick failed: {}", e),
                }
            }
            // A closed channel means the signal handler failed; keep trading
            Some(()) = shutdown_rx.recv() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    trader.persist().context("Failed to flush trading state")?;
    notifier.status(trader.state()).await;
    info!("Trading session ended.");
    Ok(())
}

/// Raise the shutdown flag and signal the loop once `signal` resolves. If the
/// handler cannot be installed the sender is held open so the loop keeps
/// running instead of seeing a closed channel.
fn spawn_shutdown_listener<F>(signal: F, shutdown_flag: Arc<AtomicBool>) -> mpsc::Receiver<()>
where
    F: Future<Output = std::io::Result<()>> + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        match signal.await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating shutdown...");
                shutdown_flag.store(true, Ordering::SeqCst);
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => {
                error!("Error setting up signal handler: {}", e);
                let _keep_open = shutdown_tx;
                std::future::pending::<()>().await;
            }
        }
    });

    shutdown_rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_sets_flag_and_notifies() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut rx = spawn_shutdown_listener(async { Ok(()) }, flag.clone());

        assert_eq!(rx.recv().await, Some(()));
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_signal_handler_keeps_loop_running() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut rx = spawn_shutdown_listener(
            async { Err(std::io::Error::new(std::io::ErrorKind::Other, "no signals")) },
            flag.clone(),
        );

        let waited = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(waited.is_err(), "channel closed or signalled: {:?}", waited);
        assert!(!flag.load(Ordering::SeqCst));
    }
}
