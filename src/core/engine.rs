use crate::core::tracker::OrderLifecycleTracker;
use crate::core::types::*;
use crate::ports::exchange::Exchange;
use crate::ports::price_feed::PriceFeed;
use crate::storage;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Single consumer of the event queue. Owns the tracker; order submission
/// runs in spawned tasks whose results come back through the same queue.
pub struct Engine {
    tracker: OrderLifecycleTracker,
    exchange: Arc<dyn Exchange>,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    marks: watch::Sender<f64>,
    ledger_path: String,
}

impl Engine {
    pub fn new(
        config: &Config,
        exchange: Arc<dyn Exchange>,
        events_tx: mpsc::Sender<Event>,
        events_rx: mpsc::Receiver<Event>,
        marks: watch::Sender<f64>,
    ) -> Self {
        Self {
            tracker: OrderLifecycleTracker::new(config),
            exchange,
            events_tx,
            events_rx,
            marks,
            ledger_path: config.ledger_path.clone(),
        }
    }

    pub fn tracker(&self) -> &OrderLifecycleTracker {
        &self.tracker
    }

    /// Replay recent history as non-live bars. Failure to fetch is tolerated.
    pub async fn warm_up(&mut self, price_feed: &dyn PriceFeed, config: &Config) {
        let symbol = config.instrument.symbol();
        let limit = config.warmup_bars();

        let candles = match price_feed.candles(&symbol, config.timeframe, limit).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                tracing::warn!("Warm-up history unavailable for {}", symbol);
                return;
            }
            Err(e) => {
                tracing::warn!("Warm-up history failed for {}: {}", symbol, e);
                return;
            }
        };

        let count = candles.len();
        for candle in candles {
            self.handle(Event::Bar(Bar {
                instrument: config.instrument.clone(),
                timeframe: config.timeframe,
                candle,
                is_live: false,
            }));
        }
        tracing::info!(
            "Warm-up replayed {} {} bars for {} (last close {:.2})",
            count,
            config.timeframe,
            config.instrument,
            self.tracker.last_price(&config.instrument).unwrap_or(0.0)
        );
    }

    pub async fn next_event(&mut self) -> Option<Event> {
        self.events_rx.recv().await
    }

    pub fn handle(&mut self, event: Event) {
        match event {
            Event::Bar(bar) => {
                self.marks.send_replace(bar.candle.close);
                if let Some(request) = self.tracker.on_market_update(&bar) {
                    self.dispatch(request);
                }
            }
            Event::OrderStatus(update) => {
                if let Ok(Some(trade)) = self.tracker.on_order_status_changed(&update) {
                    if let Err(e) = storage::append_trade(&self.ledger_path, &trade) {
                        tracing::error!("Trade ledger write failed: {}", e);
                    }
                }
            }
            Event::SubmissionResult {
                client_order_id,
                result,
            } => {
                let _ = self.tracker.on_submission_result(&client_order_id, result);
            }
            Event::Disconnected(source) => {
                tracing::warn!("{} stream disconnected — will auto-reconnect", source);
            }
        }
    }

    /// Fire-and-forget submission; the outcome re-enters as `SubmissionResult`.
    fn dispatch(&self, request: OrderRequest) {
        let exchange = self.exchange.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = exchange
                .submit_market_order(&request)
                .await
                .map_err(|e| e.to_string());
            let event = Event::SubmissionResult {
                client_order_id: request.client_order_id,
                result,
            };
            if tx.send(event).await.is_err() {
                tracing::warn!("Event queue closed before submission result was delivered");
            }
        });
    }

    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!("Entering event loop");
        loop {
            tokio::select! {
                event = self.next_event() => {
                    match event {
                        Some(event) => self.handle(event),
                        None => {
                            tracing::warn!("Event queue closed — exiting event loop");
                            break;
                        }
                    }
                }

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Shutdown signal received — exiting event loop");
                        break;
                    }
                }
            }
        }
        self.log_summary();
    }

    fn log_summary(&self) {
        let tracker = self.tracker();
        for order in tracker.outstanding_orders() {
            tracing::warn!(
                "Unresolved order at shutdown: {} {} {} {} ({})",
                order.client_order_id,
                order.status,
                order.side,
                order.size,
                order.instrument
            );
        }
        for pos in tracker.open_positions() {
            let mark = tracker.last_price(&pos.instrument).unwrap_or(0.0);
            tracing::info!(
                "Open position at shutdown: {} {} @ {:.2} | unrealized {:.2} {}",
                pos.instrument,
                pos.net_size,
                pos.avg_entry_price(),
                pos.unrealized_pnl(mark),
                pos.instrument.quote
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::paper::PaperExchange;
    use async_trait::async_trait;

    struct DownExchange;

    #[async_trait]
    impl Exchange for DownExchange {
        async fn submit_market_order(&self, _order: &OrderRequest) -> anyhow::Result<String> {
            anyhow::bail!("connection refused")
        }
    }

    struct FixedFeed(Vec<f64>);

    #[async_trait]
    impl PriceFeed for FixedFeed {
        async fn candles(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _limit: u32,
        ) -> anyhow::Result<Option<Vec<Candle>>> {
            Ok(Some(self.0.iter().enumerate().map(|(i, c)| candle(i as i64, *c)).collect()))
        }
    }

    fn candle(i: i64, close: f64) -> Candle {
        Candle {
            open_time: 1_700_000_000_000 + i * 60_000,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            close_time: 1_700_000_059_999 + i * 60_000,
        }
    }

    fn live_bar(config: &Config, i: i64, close: f64) -> Event {
        Event::Bar(Bar {
            instrument: config.instrument.clone(),
            timeframe: config.timeframe,
            candle: candle(i, close),
            is_live: true,
        })
    }

    fn config_with_temp_ledger() -> Config {
        let mut config = test_config();
        config.fee_rate = 0.0;
        config.ledger_path = std::env::temp_dir()
            .join(format!("engine-ledger-{}.md", uuid::Uuid::new_v4().simple()))
            .to_string_lossy()
            .into_owned();
        config
    }

    fn paper_engine(config: &Config) -> Engine {
        let (tx, rx) = mpsc::channel(64);
        let (marks_tx, marks_rx) = watch::channel(0.0);
        let paper = PaperExchange::new(tx.clone(), marks_rx, config.fee_rate);
        Engine::new(config, Arc::new(paper), tx, rx, marks_tx)
    }

    async fn pump(engine: &mut Engine, n: usize) {
        for _ in 0..n {
            let event = engine.next_event().await.expect("event");
            engine.handle(event);
        }
    }

    #[tokio::test]
    async fn warm_up_never_submits() {
        let config = config_with_temp_ledger();
        let mut engine = paper_engine(&config);
        engine
            .warm_up(&FixedFeed(vec![2000.0, 2001.0, 2002.0]), &config)
            .await;

        assert!(engine.tracker().order(&config.instrument).is_none());
        assert_eq!(engine.tracker().last_price(&config.instrument), Some(2002.0));
    }

    #[tokio::test]
    async fn paper_round_trip_records_trade() {
        let config = config_with_temp_ledger();
        let mut engine = paper_engine(&config);

        engine.handle(live_bar(&config, 0, 2000.0));
        // Accepted, Filled, SubmissionResult
        pump(&mut engine, 3).await;
        let pos = engine.tracker().position(&config.instrument).expect("position");
        assert!((pos.cost_basis - 200.0).abs() < 1e-9);
        let buy = engine.tracker().order(&config.instrument).unwrap();
        assert_eq!(buy.status, OrderStatus::Filled);
        assert_eq!(buy.order_id.as_deref(), Some("paper-1"));

        engine.handle(live_bar(&config, 1, 2010.0));
        pump(&mut engine, 3).await;
        assert!(engine.tracker().position(&config.instrument).is_none());

        let rows = storage::read_ledger(&config.ledger_path).unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].gross_pnl - 1.0).abs() < 1e-9);
        assert!((rows[0].net_pnl - 1.0).abs() < 1e-9);

        let _ = std::fs::remove_file(&config.ledger_path);
        let _ = std::fs::remove_file(format!("{}.bak", config.ledger_path));
    }

    #[tokio::test]
    async fn failed_submission_frees_instrument() {
        let config = config_with_temp_ledger();
        let (tx, rx) = mpsc::channel(64);
        let (marks_tx, _marks_rx) = watch::channel(0.0);
        let mut engine = Engine::new(&config, Arc::new(DownExchange), tx, rx, marks_tx);

        engine.handle(live_bar(&config, 0, 2000.0));
        pump(&mut engine, 1).await;
        assert_eq!(
            engine.tracker().order(&config.instrument).unwrap().status,
            OrderStatus::Rejected
        );

        engine.handle(live_bar(&config, 1, 2000.0));
        assert_eq!(
            engine.tracker().order(&config.instrument).unwrap().status,
            OrderStatus::Submitted
        );
    }

    #[tokio::test]
    async fn run_exits_on_shutdown() {
        let config = config_with_temp_ledger();
        let engine = paper_engine(&config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(engine.run(shutdown_rx));
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("engine stopped")
            .unwrap();
    }
}
