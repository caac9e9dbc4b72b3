use crate::core::types::*;
use crate::ports::exchange::Exchange;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};

/// Simulated venue: every market order is accepted and filled in full at the
/// latest close, with fees charged at the configured rate.
pub struct PaperExchange {
    events: mpsc::Sender<Event>,
    marks: watch::Receiver<f64>,
    fee_rate: f64,
    next_id: AtomicU64,
}

impl PaperExchange {
    pub fn new(events: mpsc::Sender<Event>, marks: watch::Receiver<f64>, fee_rate: f64) -> Self {
        Self {
            events,
            marks,
            fee_rate,
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn submit_market_order(&self, order: &OrderRequest) -> Result<String> {
        let price = *self.marks.borrow();
        if price <= 0.0 {
            anyhow::bail!("no mark price for {} yet", order.instrument);
        }

        let order_id = format!("paper-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let update = |status, size, price, fee| OrderStatusUpdate {
            order_id: order.client_order_id.clone(),
            status,
            side: order.side,
            instrument: order.instrument.clone(),
            size,
            price,
            fee,
            fee_base: None,
        };

        self.events
            .send(Event::OrderStatus(update(OrderStatus::Accepted, 0.0, 0.0, None)))
            .await?;
        self.events
            .send(Event::OrderStatus(update(
                OrderStatus::Filled,
                order.size,
                price,
                Some(order.size * price * self.fee_rate),
            )))
            .await?;

        tracing::info!(
            "PAPER: {} {} {} @ {:.2} (order {})",
            order.side,
            order.size,
            order.instrument,
            price,
            order_id
        );
        Ok(order_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> OrderRequest {
        OrderRequest {
            instrument: Instrument::new("ETH", "USDT"),
            side: Side::Buy,
            size: 0.1,
            client_order_id: "c1".into(),
        }
    }

    #[tokio::test]
    async fn fills_at_mark_with_fee() {
        let (tx, mut rx) = mpsc::channel(8);
        let (_marks_tx, marks_rx) = watch::channel(2000.0);
        let paper = PaperExchange::new(tx, marks_rx, 0.001);

        let id = paper.submit_market_order(&request()).await.unwrap();
        assert_eq!(id, "paper-1");

        let Some(Event::OrderStatus(accepted)) = rx.recv().await else {
            panic!("expected accepted");
        };
        assert_eq!(accepted.status, OrderStatus::Accepted);
        assert_eq!(accepted.order_id, "c1");

        let Some(Event::OrderStatus(filled)) = rx.recv().await else {
            panic!("expected fill");
        };
        assert_eq!(filled.status, OrderStatus::Filled);
        assert_eq!(filled.price, 2000.0);
        assert!((filled.fee.unwrap() - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rejects_without_mark() {
        let (tx, _rx) = mpsc::channel(8);
        let (_marks_tx, marks_rx) = watch::channel(0.0);
        let paper = PaperExchange::new(tx, marks_rx, 0.001);
        assert!(paper.submit_market_order(&request()).await.is_err());
    }
}
