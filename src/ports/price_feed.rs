use crate::core::types::{Candle, Timeframe};
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Most recent `limit` candles, oldest first. `Ok(None)` when the feed is
    /// unavailable.
    async fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
    ) -> Result<Option<Vec<Candle>>>;
}
