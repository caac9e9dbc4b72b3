//! Per-instrument order lifecycle and position tracking.
//!
//! The tracker is a plain owned state machine. Every handler runs to
//! completion on `&mut self`; callers serialize events before they reach it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::position::{FillEffect, Position, SIZE_EPSILON};
use crate::core::types::*;

/// Conditions the tracker handles locally by logging. None of them stop
/// event processing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Anomaly {
    #[error("status notification for unknown order {0}")]
    UnknownOrder(String),

    #[error("order {order_id} is already {status}, ignoring {incoming}")]
    StaleNotification {
        order_id: String,
        status: OrderStatus,
        incoming: OrderStatus,
    },

    #[error("order {order_id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        order_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("submission of {client_order_id} failed: {reason}")]
    SubmissionFailed {
        client_order_id: String,
        reason: String,
    },

    #[error("trade close reported for {0} while the position is still open")]
    PrematureTradeClose(Instrument),
}

pub struct OrderLifecycleTracker {
    orders: HashMap<Instrument, OrderRecord>,
    positions: HashMap<Instrument, Position>,
    /// Client and exchange order ids of the current record per instrument.
    index: HashMap<String, Instrument>,
    order_size: f64,
    fee_rate: f64,
    last_bar_at: Option<DateTime<Utc>>,
    last_price: HashMap<Instrument, f64>,
}

impl OrderLifecycleTracker {
    pub fn new(config: &Config) -> Self {
        Self::with_params(config.order_size, config.fee_rate)
    }

    pub fn with_params(order_size: f64, fee_rate: f64) -> Self {
        Self {
            orders: HashMap::new(),
            positions: HashMap::new(),
            index: HashMap::new(),
            order_size,
            fee_rate,
            last_bar_at: None,
            last_price: HashMap::new(),
        }
    }

    /// Log clock: time of the most recent bar, else wall clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.last_bar_at.unwrap_or_else(Utc::now)
    }

    pub fn order(&self, instrument: &Instrument) -> Option<&OrderRecord> {
        self.orders.get(instrument)
    }

    pub fn position(&self, instrument: &Instrument) -> Option<&Position> {
        self.positions.get(instrument)
    }

    pub fn last_price(&self, instrument: &Instrument) -> Option<f64> {
        self.last_price.get(instrument).copied()
    }

    pub fn has_outstanding_order(&self, instrument: &Instrument) -> bool {
        self.orders
            .get(instrument)
            .map(|o| !o.status.is_terminal())
            .unwrap_or(false)
    }

    pub fn outstanding_orders(&self) -> impl Iterator<Item = &OrderRecord> {
        self.orders.values().filter(|o| !o.status.is_terminal())
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values().filter(|p| p.is_open())
    }

    /// Handle one bar. Returns an order to submit when a live bar finds the
    /// instrument free: buy when flat, close the position otherwise.
    pub fn on_market_update(&mut self, bar: &Bar) -> Option<OrderRequest> {
        if let Some(ts) = bar.timestamp() {
            self.last_bar_at = Some(ts);
        }
        self.last_price
            .insert(bar.instrument.clone(), bar.candle.close);

        if !bar.is_live {
            return None;
        }
        if self.has_outstanding_order(&bar.instrument) {
            return None;
        }

        let (side, size) = match self.positions.get(&bar.instrument) {
            Some(pos) => (pos.side().opposite(), pos.net_size.abs()),
            None => (Side::Buy, self.order_size),
        };

        let request = OrderRequest {
            instrument: bar.instrument.clone(),
            side,
            size,
            client_order_id: uuid::Uuid::new_v4().simple().to_string(),
        };

        if let Some(previous) = self.orders.remove(&bar.instrument) {
            self.index.remove(&previous.client_order_id);
            if let Some(id) = previous.order_id {
                self.index.remove(&id);
            }
        }
        self.index
            .insert(request.client_order_id.clone(), bar.instrument.clone());
        self.orders.insert(
            bar.instrument.clone(),
            OrderRecord {
                instrument: bar.instrument.clone(),
                client_order_id: request.client_order_id.clone(),
                order_id: None,
                side,
                size,
                filled: 0.0,
                status: OrderStatus::Submitted,
            },
        );

        tracing::info!(
            "{} | Submitting market {} {} {} @ ~{:.2} (client id {})",
            self.now(),
            side,
            size,
            bar.instrument,
            bar.candle.close,
            request.client_order_id
        );
        Some(request)
    }

    /// Result of the fire-and-forget submission for `client_order_id`.
    /// A failure moves a still-`Submitted` order to `Rejected`; there is no
    /// retry. Once the venue has reported on the order its status wins.
    pub fn on_submission_result(
        &mut self,
        client_order_id: &str,
        result: Result<String, String>,
    ) -> Result<OrderStatus, Anomaly> {
        let ts = self.now();
        let record = self
            .index
            .get(client_order_id)
            .and_then(|inst| self.orders.get_mut(inst))
            .filter(|o| o.client_order_id == client_order_id);

        let Some(record) = record else {
            let anomaly = Anomaly::UnknownOrder(client_order_id.to_string());
            tracing::warn!("{} | {}", ts, anomaly);
            return Err(anomaly);
        };

        match result {
            Ok(order_id) => {
                tracing::info!(
                    "{} | Order {} acknowledged as {} ({} {} {})",
                    ts,
                    client_order_id,
                    order_id,
                    record.side,
                    record.size,
                    record.instrument
                );
                self.index
                    .insert(order_id.clone(), record.instrument.clone());
                record.order_id = Some(order_id);
                Ok(record.status)
            }
            Err(reason) => {
                let failure = Anomaly::SubmissionFailed {
                    client_order_id: client_order_id.to_string(),
                    reason,
                };
                if record.status != OrderStatus::Submitted {
                    tracing::warn!("{} | {} (order already {})", ts, failure, record.status);
                    return Ok(record.status);
                }
                tracing::error!("{} | {}", ts, failure);
                record.status = OrderStatus::Rejected;
                Ok(OrderStatus::Rejected)
            }
        }
    }

    /// Apply a status notification from the venue. Returns the trade closed
    /// by this execution, if any.
    pub fn on_order_status_changed(
        &mut self,
        update: &OrderStatusUpdate,
    ) -> Result<Option<TradeResult>, Anomaly> {
        let ts = self.now();
        let Some(instrument) = self.index.get(&update.order_id).cloned() else {
            let anomaly = Anomaly::UnknownOrder(update.order_id.clone());
            tracing::warn!("{} | {}", ts, anomaly);
            return Err(anomaly);
        };
        let Some(record) = self
            .orders
            .get_mut(&instrument)
            .filter(|o| o.matches(&update.order_id))
        else {
            let anomaly = Anomaly::UnknownOrder(update.order_id.clone());
            tracing::warn!("{} | {}", ts, anomaly);
            return Err(anomaly);
        };

        if record.status.is_terminal() {
            let anomaly = Anomaly::StaleNotification {
                order_id: update.order_id.clone(),
                status: record.status,
                incoming: update.status,
            };
            tracing::warn!("{} | {}", ts, anomaly);
            return Err(anomaly);
        }
        if update.status == record.status && update.status != OrderStatus::PartiallyFilled {
            tracing::debug!("{} | Duplicate {} for order {}", ts, update.status, update.order_id);
            return Ok(None);
        }
        if !record.status.can_transition_to(update.status) {
            let anomaly = Anomaly::IllegalTransition {
                order_id: update.order_id.clone(),
                from: record.status,
                to: update.status,
            };
            tracing::warn!("{} | {}", ts, anomaly);
            return Err(anomaly);
        }

        record.status = update.status;
        tracing::info!(
            "{} | Order {} {} | {} {} {} @ {:.2}",
            ts,
            update.order_id,
            update.status,
            update.side,
            update.size,
            instrument,
            update.price
        );

        let fills = matches!(
            update.status,
            OrderStatus::PartiallyFilled | OrderStatus::Filled
        );
        if !fills || update.size <= SIZE_EPSILON {
            return Ok(None);
        }

        record.filled += update.size;
        let side = record.side;
        let fee = update
            .fee
            .unwrap_or(update.size * update.price * self.fee_rate);
        // Base-asset commission changes what the account holds, not what traded.
        let held = update.size - side.sign() * update.fee_base.unwrap_or(0.0);
        if held <= SIZE_EPSILON {
            return Ok(None);
        }
        self.apply_fill(&instrument, side, held, update.price, fee, ts)
    }

    /// Report a realized trade. Refused while the instrument still holds an
    /// open position, so each closure is reported once.
    pub fn on_trade_closed(&self, trade: &TradeResult) -> Result<(), Anomaly> {
        if self.positions.contains_key(&trade.instrument) {
            let anomaly = Anomaly::PrematureTradeClose(trade.instrument.clone());
            tracing::warn!("{} | {}", self.now(), anomaly);
            return Err(anomaly);
        }
        tracing::info!(
            "{} | Trade closed {} {} {} | Gross {:.2} {} | Net {:.2} {}",
            trade.closed_at,
            trade.instrument,
            trade.side,
            trade.size,
            trade.gross_pnl,
            trade.instrument.quote,
            trade.net_pnl,
            trade.instrument.quote
        );
        Ok(())
    }

    fn apply_fill(
        &mut self,
        instrument: &Instrument,
        side: Side,
        size: f64,
        price: f64,
        fee: f64,
        at: DateTime<Utc>,
    ) -> Result<Option<TradeResult>, Anomaly> {
        let Some(pos) = self.positions.get_mut(instrument) else {
            let pos = Position::open(instrument.clone(), side, size, price, fee, at);
            tracing::info!(
                "{} | Position opened: {} {} {} at cost basis {:.2}",
                at,
                side,
                size,
                instrument,
                pos.cost_basis
            );
            self.positions.insert(instrument.clone(), pos);
            return Ok(None);
        };

        match pos.apply_fill(side, size, price, fee, at) {
            FillEffect::Adjusted => {
                tracing::info!(
                    "{} | Position {} now {} at cost basis {:.2}",
                    at,
                    instrument,
                    pos.net_size,
                    pos.cost_basis
                );
                Ok(None)
            }
            FillEffect::Closed { trade, remainder } => {
                self.positions.remove(instrument);
                self.on_trade_closed(&trade)?;
                if let Some((rest, rest_fee)) = remainder {
                    self.positions.insert(
                        instrument.clone(),
                        Position::open(instrument.clone(), side, rest, price, rest_fee, at),
                    );
                }
                Ok(Some(trade))
            }
        }
    }
}
