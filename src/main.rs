mod adapters;
mod core;
mod ports;
mod safety;
mod storage;

use std::sync::Arc;

use crate::adapters::binance::BinanceClient;
use crate::adapters::paper::PaperExchange;
use crate::adapters::{binance_user_ws, binance_ws};
use crate::core::engine::Engine;
use crate::core::types::{Config, Event};
use crate::ports::exchange::Exchange;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenv::dotenv() {
        eprintln!("WARNING: .env load failed: {}", e);
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        "binance-lifecycle-bot | {} {} size={} fee={} testnet={} paper_trade={}",
        config.instrument,
        config.timeframe,
        config.order_size,
        config.fee_rate,
        config.testnet,
        config.paper_trade
    );

    safety::validate_startup(&config)?;

    let ledger = storage::read_ledger(&config.ledger_path)?;
    tracing::info!(
        "Trade ledger {}: {} trades, net {:.2} {}",
        config.ledger_path,
        ledger.len(),
        storage::total_net_pnl(&ledger),
        config.instrument.quote
    );

    let binance = Arc::new(BinanceClient::new(&config)?);
    let shutdown_rx = safety::setup_signal_handler();

    let (events_tx, events_rx) = tokio::sync::mpsc::channel::<Event>(256);
    let (marks_tx, marks_rx) = tokio::sync::watch::channel(0.0_f64);

    let exchange: Arc<dyn Exchange> = if config.paper_trade {
        Arc::new(PaperExchange::new(events_tx.clone(), marks_rx, config.fee_rate))
    } else {
        binance.clone()
    };

    let mut engine = Engine::new(&config, exchange, events_tx.clone(), events_rx, marks_tx);
    engine.warm_up(binance.as_ref(), &config).await;

    // Binance kline WebSocket
    let ws_url = config.ws_base_url.clone();
    let instrument = config.instrument.clone();
    let timeframe = config.timeframe;
    let market_tx = events_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = binance_ws::connect(&ws_url, instrument, timeframe, market_tx).await {
            tracing::error!("Binance WS fatal: {}", e);
        }
    });

    // Binance user-data WebSocket
    if !config.paper_trade {
        let client = binance.clone();
        let ws_url = config.ws_base_url.clone();
        let instrument = config.instrument.clone();
        let user_tx = events_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = binance_user_ws::connect(client, ws_url, instrument, user_tx).await {
                tracing::error!("Binance user stream fatal: {}", e);
            }
        });
    }
    drop(events_tx);

    engine.run(shutdown_rx).await;

    tracing::info!("binance-lifecycle-bot stopped");
    Ok(())
}
