use crate::core::types::*;
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Exchange: Send + Sync {
    /// Submit a market order. Returns the venue's order id; the order's
    /// progress arrives later as status notifications.
    async fn submit_market_order(&self, order: &OrderRequest) -> Result<String>;
}
