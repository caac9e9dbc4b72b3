use crate::core::types::*;
use chrono::{DateTime, Utc};

/// Sizes below this are treated as flat.
pub const SIZE_EPSILON: f64 = 1e-9;

/// Net exposure for one instrument, built from fills.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub instrument: Instrument,
    /// Signed: positive = long, negative = short.
    pub net_size: f64,
    /// Quote value of the open exposure at entry prices.
    pub cost_basis: f64,
    /// Fees paid on every fill attributed to this position.
    pub fees: f64,
    pub opened_at: DateTime<Utc>,
    entry_side: Side,
    entry_size: f64,
    entry_value: f64,
    exit_size: f64,
    exit_value: f64,
    realized: f64,
}

/// What a fill did to an open position.
#[derive(Debug, Clone, PartialEq)]
pub enum FillEffect {
    Adjusted,
    /// Exposure returned to zero. `remainder` is the part of the fill that
    /// crossed through flat and opens the next position.
    Closed {
        trade: TradeResult,
        remainder: Option<(f64, f64)>,
    },
}

impl Position {
    pub fn open(
        instrument: Instrument,
        side: Side,
        size: f64,
        price: f64,
        fee: f64,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            instrument,
            net_size: side.sign() * size,
            cost_basis: size * price,
            fees: fee,
            opened_at: at,
            entry_side: side,
            entry_size: size,
            entry_value: size * price,
            exit_size: 0.0,
            exit_value: 0.0,
            realized: 0.0,
        }
    }

    pub fn side(&self) -> Side {
        if self.net_size >= 0.0 {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    pub fn is_open(&self) -> bool {
        self.net_size.abs() > SIZE_EPSILON
    }

    pub fn avg_entry_price(&self) -> f64 {
        if self.net_size.abs() <= SIZE_EPSILON {
            return 0.0;
        }
        self.cost_basis / self.net_size.abs()
    }

    /// Gross P&L if the open size were closed at `mark`.
    pub fn unrealized_pnl(&self, mark: f64) -> f64 {
        (mark - self.avg_entry_price()) * self.net_size
    }

    /// Apply one execution. `fee` is in quote units for the whole execution.
    pub fn apply_fill(
        &mut self,
        side: Side,
        size: f64,
        price: f64,
        fee: f64,
        at: DateTime<Utc>,
    ) -> FillEffect {
        if side == self.side() {
            self.net_size += side.sign() * size;
            self.cost_basis += size * price;
            self.entry_size += size;
            self.entry_value += size * price;
            self.fees += fee;
            return FillEffect::Adjusted;
        }

        let held = self.net_size.abs();
        let closing = size.min(held);
        let avg_entry = self.avg_entry_price();

        self.realized += (price - avg_entry) * closing * self.side().sign();
        self.cost_basis -= avg_entry * closing;
        self.exit_size += closing;
        self.exit_value += price * closing;
        self.fees += fee * closing / size;
        self.net_size += side.sign() * closing;

        if held - closing > SIZE_EPSILON {
            return FillEffect::Adjusted;
        }

        let trade = TradeResult {
            instrument: self.instrument.clone(),
            side: self.entry_side,
            size: self.exit_size,
            entry_price: self.entry_value / self.entry_size,
            exit_price: self.exit_value / self.exit_size,
            gross_pnl: self.realized,
            net_pnl: self.realized - self.fees,
            opened_at: self.opened_at,
            closed_at: at,
        };
        self.net_size = 0.0;
        self.cost_basis = 0.0;

        let leftover = size - closing;
        let remainder = (leftover > SIZE_EPSILON).then(|| (leftover, fee * leftover / size));
        FillEffect::Closed { trade, remainder }
    }
}
