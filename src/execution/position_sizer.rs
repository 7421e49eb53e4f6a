use rust_decimal::Decimal;
use std::fmt;

use crate::models::{CanonicalOrderEvent, FollowerConnection, MarketType, Position};

/// Default nominal capital assumed behind a futures master account.
pub const DEFAULT_MASTER_CAPITAL: i64 = 60_000;

/// How a master fill is translated into a follower quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingStrategy {
    /// Mirror the master's exposure relative to capital:
    /// `qty = master_qty × reserved_capital / master_capital`.
    Proportional { master_capital: Decimal },
    /// Risk a fixed share of reserved capital per trade:
    /// `qty = reserved_capital × risk_pct / 100 / price`.
    RiskPct,
}

impl SizingStrategy {
    /// Futures masters are mirrored proportionally, spot masters by risk share.
    pub fn for_market(market: MarketType, master_capital: Decimal) -> Self {
        match market {
            MarketType::Futures => SizingStrategy::Proportional { master_capital },
            MarketType::Spot => SizingStrategy::RiskPct,
        }
    }
}

impl fmt::Display for SizingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizingStrategy::Proportional { master_capital } => {
                write!(f, "proportional({master_capital})")
            }
            SizingStrategy::RiskPct => write!(f, "risk_pct"),
        }
    }
}

/// Why a follower gets no replica for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Scaled quantity rounds to zero under the quantity step.
    BelowStep,
    /// Close intent but the follower holds nothing to close.
    NoPositionToReduce,
    /// Spot sell without holdings; spot accounts cannot go short.
    NoHoldings,
    InsufficientBalance,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::BelowStep => "below_step",
            SkipReason::NoPositionToReduce => "no_position",
            SkipReason::NoHoldings => "no_holdings",
            SkipReason::InsufficientBalance => "insufficient_balance",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaPlan {
    Open { quantity: Decimal },
    /// Partial reduction of the open position.
    Reduce { quantity: Decimal },
    /// Close the whole open position.
    CloseAll { quantity: Decimal },
    Skip(SkipReason),
}

impl ReplicaPlan {
    pub fn is_close(&self) -> bool {
        matches!(self, ReplicaPlan::Reduce { .. } | ReplicaPlan::CloseAll { .. })
    }
}

/// Follower quantity before step rounding.
pub fn scaled_quantity(
    strategy: SizingStrategy,
    connection: &FollowerConnection,
    event: &CanonicalOrderEvent,
) -> Decimal {
    let raw = match strategy {
        SizingStrategy::Proportional { master_capital } => {
            if master_capital <= Decimal::ZERO {
                return Decimal::ZERO;
            }
            event.filled_quantity * connection.reserved_capital / master_capital
        }
        SizingStrategy::RiskPct => {
            let price = event.reference_price();
            if price <= Decimal::ZERO {
                return Decimal::ZERO;
            }
            connection.reserved_capital * connection.risk_pct / Decimal::ONE_HUNDRED / price
        }
    };
    raw.max(Decimal::ZERO)
}

/// Round `qty` down to a multiple of `step`.
pub fn round_to_step(qty: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return qty;
    }
    ((qty / step).floor() * step).normalize()
}

/// Decide what a follower should do for one master event.
///
/// An event closes when it is flagged reduce-only or when the follower
/// holds the opposite side. Closes never exceed the open quantity, and a
/// remainder too small to trade is folded into a full close.
pub fn plan_replica(
    strategy: SizingStrategy,
    connection: &FollowerConnection,
    event: &CanonicalOrderEvent,
    open: Option<&Position>,
    step: Decimal,
) -> ReplicaPlan {
    let scaled = scaled_quantity(strategy, connection, event);
    let spot = connection.exchange.market_type() == MarketType::Spot;
    let opposite = open.filter(|p| p.side() == Some(event.side.opposite()));

    if event.reduce_only || opposite.is_some() {
        let Some(position) = opposite else {
            return ReplicaPlan::Skip(if spot {
                SkipReason::NoHoldings
            } else {
                SkipReason::NoPositionToReduce
            });
        };
        let held = position.total_quantity;
        let wanted = round_to_step(scaled.min(held), step);
        if round_to_step(held - wanted, step).is_zero() {
            // Ledger rows can carry dust below the venue step.
            let quantity = round_to_step(held, step);
            if quantity.is_zero() {
                return ReplicaPlan::Skip(SkipReason::BelowStep);
            }
            return ReplicaPlan::CloseAll { quantity };
        }
        if wanted.is_zero() {
            return ReplicaPlan::Skip(SkipReason::BelowStep);
        }
        return ReplicaPlan::Reduce { quantity: wanted };
    }

    if spot && event.side == crate::models::Side::Sell {
        return ReplicaPlan::Skip(SkipReason::NoHoldings);
    }

    let quantity = round_to_step(scaled, step);
    if quantity.is_zero() {
        return ReplicaPlan::Skip(SkipReason::BelowStep);
    }
    ReplicaPlan::Open { quantity }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
