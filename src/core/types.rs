use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Instruments ──

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    pub base: String,
    pub quote: String,
}

impl Instrument {
    pub fn new(base: &str, quote: &str) -> Self {
        Self {
            base: base.to_uppercase(),
            quote: quote.to_uppercase(),
        }
    }

    /// Exchange symbol, e.g. `ETHUSDT`.
    pub fn symbol(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn as_binance(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        })
    }
}

// ── Market Data ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeframe {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    D1,
}

impl Timeframe {
    pub fn minutes(self) -> u32 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M3 => 3,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H2 => 120,
            Timeframe::H4 => 240,
            Timeframe::D1 => 1440,
        }
    }

    /// Binance kline interval string.
    pub fn as_interval(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "1m" => Timeframe::M1,
            "3m" => Timeframe::M3,
            "5m" => Timeframe::M5,
            "15m" => Timeframe::M15,
            "30m" => Timeframe::M30,
            "1h" => Timeframe::H1,
            "2h" => Timeframe::H2,
            "4h" => Timeframe::H4,
            "1d" => Timeframe::D1,
            other => anyhow::bail!("unsupported timeframe: {}", other),
        })
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_interval())
    }
}

#[derive(Debug, Clone)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

/// One bar delivered to the tracker. `is_live` is false for warm-up history.
#[derive(Debug, Clone)]
pub struct Bar {
    pub instrument: Instrument,
    pub timeframe: Timeframe,
    pub candle: Candle,
    pub is_live: bool,
}

impl Bar {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.candle.open_time)
    }
}

// ── Orders ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    None,
    Submitted,
    Accepted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    /// Position along the lifecycle; exchange updates never move an order backwards.
    fn rank(self) -> u8 {
        match self {
            OrderStatus::None => 0,
            OrderStatus::Submitted => 1,
            OrderStatus::Accepted => 2,
            OrderStatus::PartiallyFilled => 3,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected => 4,
        }
    }

    /// Whether `self -> next` is a legal lifecycle step.
    ///
    /// Repeated `PartiallyFilled` is allowed. Rejection is only possible before
    /// the venue accepts the order.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        if self.is_terminal() || next == OrderStatus::None {
            return false;
        }
        match next {
            OrderStatus::Rejected => matches!(self, OrderStatus::None | OrderStatus::Submitted),
            OrderStatus::PartiallyFilled => self.rank() <= next.rank(),
            _ => self.rank() < next.rank(),
        }
    }

    pub fn from_binance(status: &str) -> Option<Self> {
        Some(match status {
            "NEW" => OrderStatus::Accepted,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Cancelled,
            "REJECTED" => OrderStatus::Rejected,
            _ => return None,
        })
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OrderStatus::None => "None",
            OrderStatus::Submitted => "Submitted",
            OrderStatus::Accepted => "Accepted",
            OrderStatus::PartiallyFilled => "PartiallyFilled",
            OrderStatus::Filled => "Filled",
            OrderStatus::Cancelled => "Cancelled",
            OrderStatus::Rejected => "Rejected",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub instrument: Instrument,
    pub side: Side,
    pub size: f64,
    pub client_order_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRecord {
    pub instrument: Instrument,
    pub client_order_id: String,
    pub order_id: Option<String>,
    pub side: Side,
    pub size: f64,
    pub filled: f64,
    pub status: OrderStatus,
}

impl OrderRecord {
    pub fn matches(&self, id: &str) -> bool {
        self.client_order_id == id || self.order_id.as_deref() == Some(id)
    }
}

/// Push notification from the venue about one order.
///
/// `size` and `price` describe this execution only, not the cumulative fill.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderStatusUpdate {
    pub order_id: String,
    pub status: OrderStatus,
    pub side: Side,
    pub instrument: Instrument,
    pub size: f64,
    pub price: f64,
    /// Commission in quote units when the venue reports it.
    pub fee: Option<f64>,
    /// Commission taken in the base asset, deducted from the quantity the
    /// account actually receives.
    pub fee_base: Option<f64>,
}

// ── Events ──

/// Everything the engine consumes, serialized through one queue.
#[derive(Debug, Clone)]
pub enum Event {
    Bar(Bar),
    OrderStatus(OrderStatusUpdate),
    SubmissionResult {
        client_order_id: String,
        result: Result<String, String>,
    },
    Disconnected(&'static str),
}

// ── Trades ──

#[derive(Debug, Clone, PartialEq)]
pub struct TradeResult {
    pub instrument: Instrument,
    /// Side of the position that was closed.
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub gross_pnl: f64,
    pub net_pnl: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LedgerRow {
    pub closed_at: String,
    pub instrument: String,
    pub side: String,
    pub size: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub gross_pnl: f64,
    pub net_pnl: f64,
}

// ── Config ──

pub struct Config {
    pub instrument: Instrument,
    pub order_size: f64,
    pub fee_rate: f64,
    pub timeframe: Timeframe,
    pub lookback_minutes: u32,
    pub testnet: bool,
    pub paper_trade: bool,
    pub confirm_live: bool,
    pub api_key: String,
    pub api_secret: String,
    pub rest_base_url: String,
    pub ws_base_url: String,
    pub ledger_path: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let base = env_or("BOT_BASE_ASSET", "ETH");
        let quote = env_or("BOT_QUOTE_ASSET", "USDT");
        let testnet = std::env::var("BINANCE_TESTNET")
            .map(|v| v != "false")
            .unwrap_or(true);

        let (rest_base_url, ws_base_url) = if testnet {
            (
                "https://testnet.binance.vision".to_string(),
                "wss://testnet.binance.vision/ws".to_string(),
            )
        } else {
            (
                "https://api.binance.com".to_string(),
                "wss://stream.binance.com:9443/ws".to_string(),
            )
        };

        Ok(Self {
            instrument: Instrument::new(&base, &quote),
            order_size: env_parse("BOT_ORDER_SIZE", 0.1)?,
            fee_rate: env_parse("BOT_FEE_RATE", 0.001)?,
            timeframe: env_or("BOT_TIMEFRAME", "1m").parse()?,
            lookback_minutes: env_parse("BOT_LOOKBACK_MINUTES", 60)?,
            testnet,
            paper_trade: std::env::var("PAPER_TRADE")
                .map(|v| v != "false")
                .unwrap_or(true),
            confirm_live: std::env::var("CONFIRM_LIVE")
                .map(|v| v == "true")
                .unwrap_or(false),
            api_key: std::env::var("BINANCE_API_KEY").unwrap_or_default(),
            api_secret: std::env::var("BINANCE_API_SECRET").unwrap_or_default(),
            rest_base_url: std::env::var("BINANCE_REST_URL").unwrap_or(rest_base_url),
            ws_base_url: std::env::var("BINANCE_WS_URL").unwrap_or(ws_base_url),
            ledger_path: env_or("TRADE_LEDGER_PATH", "trades.md"),
        })
    }

    /// Number of warm-up bars to replay, capped at the klines page size.
    pub fn warmup_bars(&self) -> u32 {
        (self.lookback_minutes / self.timeframe.minutes()).clamp(1, 1000)
    }
}

#[cfg(test)]
pub fn test_config() -> Config {
    Config {
        instrument: Instrument::new("ETH", "USDT"),
        order_size: 0.1,
        fee_rate: 0.001,
        timeframe: Timeframe::M1,
        lookback_minutes: 60,
        testnet: true,
        paper_trade: true,
        confirm_live: false,
        api_key: String::new(),
        api_secret: String::new(),
        rest_base_url: "https://testnet.binance.vision".into(),
        ws_base_url: "wss://testnet.binance.vision/ws".into(),
        ledger_path: "trades.md".into(),
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn env_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} = {:?} is invalid: {}", key, raw, e)),
        Err(_) => Ok(default),
    }
}
