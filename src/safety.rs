use crate::core::types::Config;
use tokio::sync::watch;

pub fn validate_startup(config: &Config) -> anyhow::Result<()> {
    if !config.order_size.is_finite() || config.order_size <= 0.0 {
        anyhow::bail!("BOT_ORDER_SIZE must be positive, got {}", config.order_size);
    }
    if !(0.0..0.1).contains(&config.fee_rate) {
        anyhow::bail!("BOT_FEE_RATE must be in [0, 0.1), got {}", config.fee_rate);
    }
    if config.lookback_minutes == 0 {
        anyhow::bail!("BOT_LOOKBACK_MINUTES must be at least 1");
    }

    if !config.paper_trade {
        if config.api_key.is_empty() {
            anyhow::bail!("BINANCE_API_KEY not set");
        }
        if config.api_secret.is_empty() {
            anyhow::bail!("BINANCE_API_SECRET not set");
        }
    }

    if !config.paper_trade && !config.testnet && !config.confirm_live {
        anyhow::bail!(
            "PAPER_TRADE=false on mainnet but CONFIRM_LIVE is not true. \
             Set CONFIRM_LIVE=true to acknowledge real money trading."
        );
    }

    if !config.paper_trade && !config.testnet {
        tracing::warn!("LIVE TRADING ENABLED — real money at risk");
    }

    Ok(())
}

/// Set up a signal handler for graceful shutdown (SIGINT, SIGTERM).
/// Returns a watch receiver that becomes `true` when shutdown is requested.
pub fn setup_signal_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("Failed to register SIGTERM: {}", e);
                    let _ = ctrl_c.await;
                    let _ = tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {
                    tracing::info!("Received SIGINT — shutting down gracefully");
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM — shutting down gracefully");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            tracing::info!("Received Ctrl+C — shutting down gracefully");
        }
        let _ = tx.send(true);
    });
    rx
}
