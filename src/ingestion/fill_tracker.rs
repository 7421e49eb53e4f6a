use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};

const DEFAULT_CAPACITY: usize = 1000;

/// Converts cumulative filled quantities reported by push venues into
/// per-notification deltas.
///
/// Exchanges report how much of an order has filled *so far*. A partial
/// fill followed by the final fill would otherwise be copied twice, and a
/// re-delivered notification (common after reconnects) would be copied
/// again. Bounded: the oldest order is forgotten once capacity is reached.
#[derive(Debug, Clone)]
pub struct FillTracker {
    cumulative: HashMap<String, Decimal>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Default for FillTracker {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl FillTracker {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cumulative: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record the cumulative filled quantity for `order_id` and return the
    /// newly filled part, or `None` if nothing new has filled.
    pub fn observe(&mut self, order_id: &str, cumulative_qty: Decimal) -> Option<Decimal> {
        let previous = match self.cumulative.get(order_id) {
            Some(prev) => *prev,
            None => {
                if self.order.len() == self.capacity {
                    if let Some(oldest) = self.order.pop_front() {
                        self.cumulative.remove(&oldest);
                    }
                }
                self.order.push_back(order_id.to_string());
                Decimal::ZERO
            }
        };

        if cumulative_qty <= previous {
            self.cumulative.insert(order_id.to_string(), previous);
            return None;
        }
        self.cumulative.insert(order_id.to_string(), cumulative_qty);
        Some(cumulative_qty - previous)
    }

    pub fn len(&self) -> usize {
        self.cumulative.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cumulative.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(v: &str) -> Decimal {
        v.parse().unwrap()
    }

    #[test]
    fn partial_then_final_fill_yields_deltas() {
        let mut tracker = FillTracker::default();
        assert_eq!(tracker.observe("42", d("0.3")), Some(d("0.3")));
        assert_eq!(tracker.observe("42", d("1.0")), Some(d("0.7")));
    }

    #[test]
    fn redelivery_is_dropped() {
        let mut tracker = FillTracker::default();
        assert_eq!(tracker.observe("42", d("1.0")), Some(d("1.0")));
        assert_eq!(tracker.observe("42", d("1.0")), None);
        assert_eq!(tracker.observe("42", d("0.5")), None);
    }

    #[test]
    fn zero_quantity_is_not_a_fill() {
        let mut tracker = FillTracker::default();
        assert_eq!(tracker.observe("7", Decimal::ZERO), None);
    }

    #[test]
    fn bounded_by_capacity() {
        let mut tracker = FillTracker::with_capacity(2);
        tracker.observe("a", d("1"));
        tracker.observe("b", d("1"));
        tracker.observe("c", d("1"));
        assert_eq!(tracker.len(), 2);
        // "a" was forgotten, so its quantity counts again
        assert_eq!(tracker.observe("a", d("1")), Some(d("1")));
    }
}
