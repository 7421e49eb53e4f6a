use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{LedgerError, PositionLedger};
use crate::models::{averaged_entry, Position, PositionStatus, Side};

/// Closed rows kept for inspection; older ones are dropped first.
pub const MAX_CLOSED_HISTORY: usize = 1000;

#[derive(Debug, Default)]
struct LedgerState {
    open: HashMap<(i64, String), Position>,
    closed: VecDeque<Position>,
}

impl LedgerState {
    fn archive(&mut self, pos: Position) -> Position {
        let closed = close(pos);
        if self.closed.len() == MAX_CLOSED_HISTORY {
            self.closed.pop_front();
        }
        self.closed.push_back(closed.clone());
        closed
    }
}

/// Ledger kept in process memory for tests. Each operation holds the lock
/// for its whole read-modify-write, so it gives the same one-open-row
/// guarantee as the Postgres ledger.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn closed_positions(&self, follower_id: i64) -> Vec<Position> {
        self.state()
            .closed
            .iter()
            .filter(|p| p.follower_id == follower_id)
            .cloned()
            .collect()
    }
}

fn close(mut pos: Position) -> Position {
    pos.status = PositionStatus::CLOSED.to_string();
    pos.closed_at = Some(Utc::now());
    pos
}

#[async_trait]
impl PositionLedger for InMemoryLedger {
    async fn open_position(
        &self,
        follower_id: i64,
        symbol: &str,
    ) -> Result<Option<Position>, LedgerError> {
        Ok(self
            .state()
            .open
            .get(&(follower_id, symbol.to_string()))
            .cloned())
    }

    async fn record_fill(
        &self,
        follower_id: i64,
        symbol: &str,
        side: Side,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<Position, LedgerError> {
        let mut state = self.state();
        let key = (follower_id, symbol.to_string());

        if let Some(pos) = state.open.get_mut(&key) {
            if pos.side() != Some(side) {
                return Err(LedgerError::SideMismatch {
                    follower_id,
                    symbol: symbol.to_string(),
                    existing: pos.side.clone(),
                    requested: side,
                });
            }
            pos.avg_entry_price = averaged_entry(pos.avg_entry_price, pos.total_quantity, price, quantity);
            pos.total_quantity += quantity;
            return Ok(pos.clone());
        }

        let pos = Position {
            id: Uuid::new_v4(),
            follower_id,
            symbol: symbol.to_string(),
            side: side.as_str().to_string(),
            avg_entry_price: price,
            total_quantity: quantity,
            status: PositionStatus::OPEN.to_string(),
            opened_at: Utc::now(),
            closed_at: None,
        };
        state.open.insert(key, pos.clone());
        Ok(pos)
    }

    async fn reduce_position(
        &self,
        follower_id: i64,
        symbol: &str,
        quantity: Decimal,
    ) -> Result<Option<Position>, LedgerError> {
        let mut state = self.state();
        let key = (follower_id, symbol.to_string());

        let Some(pos) = state.open.get_mut(&key) else {
            return Ok(None);
        };
        if quantity < pos.total_quantity {
            pos.total_quantity -= quantity;
            return Ok(Some(pos.clone()));
        }

        let Some(pos) = state.open.remove(&key) else {
            return Ok(None);
        };
        Ok(Some(state.archive(pos)))
    }

    async fn record_close(
        &self,
        follower_id: i64,
        symbol: &str,
    ) -> Result<Option<Position>, LedgerError> {
        let mut state = self.state();
        let Some(pos) = state.open.remove(&(follower_id, symbol.to_string())) else {
            return Ok(None);
        };
        Ok(Some(state.archive(pos)))
    }

    async fn list_open_positions(
        &self,
        follower_id: Option<i64>,
    ) -> Result<Vec<Position>, LedgerError> {
        let mut positions: Vec<Position> = self
            .state()
            .open
            .values()
            .filter(|p| follower_id.map_or(true, |id| p.follower_id == id))
            .cloned()
            .collect();
        positions.sort_by(|a, b| b.opened_at.cmp(&a.opened_at));
        Ok(positions)
    }
}
