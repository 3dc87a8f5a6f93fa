//! Assignment of symbols to connection slots
//!
//! Pure function of the current slot loads, the requested symbols with their
//! weights and the pool limits. Greedy best-fit: a symbol goes to the slot it
//! fills most tightly, ties broken by lowest current load and then by slot
//! creation order. A new slot is opened only when no existing slot fits.

use crate::error::{MarketDataError, Result};
use crate::symbol::Symbol;

/// Limits applying to every slot of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    /// Weight capacity per connection; `None` caps by symbol count only
    pub capacity: Option<u64>,
    pub max_symbols_per_connection: usize,
    /// Upper bound on open connections, 0 for unlimited
    pub max_connections: usize,
}

impl PlanLimits {
    fn can_open(&self, slots: usize) -> bool {
        self.max_connections == 0 || slots < self.max_connections
    }

    fn fits(&self, slot: &SlotLoad, weight: u64) -> bool {
        slot.symbols < self.max_symbols_per_connection
            && self
                .capacity
                .map_or(true, |capacity| {
                    slot.weight
                        .checked_add(weight)
                        .is_some_and(|total| total <= capacity)
                })
    }

    /// Room left on `slot` once `weight` is added; smaller is a tighter fit
    fn remaining_after(&self, slot: &SlotLoad, weight: u64) -> u64 {
        match self.capacity {
            Some(capacity) => capacity.saturating_sub(slot.weight.saturating_add(weight)),
            None => (self.max_symbols_per_connection - slot.symbols - 1) as u64,
        }
    }
}

/// Current occupation of a slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotLoad {
    pub weight: u64,
    pub symbols: usize,
}

impl SlotLoad {
    pub fn add(&mut self, weight: u64) {
        self.weight = self.weight.saturating_add(weight);
        self.symbols += 1;
    }

    pub fn remove(&mut self, weight: u64) {
        self.weight = self.weight.saturating_sub(weight);
        self.symbols = self.symbols.saturating_sub(1);
    }
}

/// Result of planning a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Slot index per symbol; indices past the current slots refer to new slots
    pub placements: Vec<(Symbol, usize)>,
    pub new_slots: usize,
}

/// Pick the slot `weight` fits best, by index into `slots`
pub fn best_fit(slots: &[SlotLoad], weight: u64, limits: &PlanLimits) -> Option<usize> {
    slots
        .iter()
        .enumerate()
        .filter(|(_, slot)| limits.fits(slot, weight))
        .min_by_key(|(index, slot)| (limits.remaining_after(slot, weight), slot.weight, *index))
        .map(|(index, _)| index)
}

/// Place every requested symbol or none of them
///
/// Requests are handled heaviest first (best-fit decreasing), ties in symbol
/// order, so a batch gives the same assignment regardless of input order.
pub fn plan(
    current: &[SlotLoad],
    requests: &[(Symbol, u64)],
    limits: &PlanLimits,
) -> Result<Assignment> {
    let mut slots = current.to_vec();
    let mut ordered: Vec<&(Symbol, u64)> = requests.iter().collect();
    ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut placements = Vec::with_capacity(requests.len());
    for (symbol, weight) in ordered {
        let weight = (*weight).max(1);
        let index = match best_fit(&slots, weight, limits) {
            Some(index) => index,
            None => {
                let empty = SlotLoad::default();
                if !limits.can_open(slots.len()) || !limits.fits(&empty, weight) {
                    return Err(MarketDataError::CapacityExceeded {
                        symbol: symbol.to_string(),
                    });
                }
                slots.push(empty);
                slots.len() - 1
            }
        };

        slots[index].add(weight);
        placements.push((symbol.clone(), index));
    }

    Ok(Assignment {
        placements,
        new_slots: slots.len() - current.len(),
    })
}
