//! Persistence and winner lookup consumed by the coordinator.
//!
//! [`BetStore`] and [`WinnerOracle`] are the seams between the protocol core
//! and whatever keeps the bets.  [`MemoryLedger`] implements both in memory:
//! bets are appended in arrival order and a wager wins when its number equals
//! the configured winning number.

use std::collections::HashMap;

use thiserror::Error;

use crate::wager::Wager;

/// Number drawn when none is configured.
pub const DEFAULT_WINNING_NUMBER: u32 = 7574;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Bets arrived after the draw.
    #[error("betting is closed: the draw has already taken place")]
    DrawClosed,
    /// Winners were requested before the draw.
    #[error("the draw has not taken place yet")]
    NotDrawn,
}

/// Persists whole batches.
pub trait BetStore {
    /// Persist every wager of `wagers`, or none of them.
    fn store(&mut self, wagers: &[Wager]) -> Result<(), StoreError>;
}

/// Decides winners once all agencies are done.
pub trait WinnerOracle {
    /// Perform the draw.  Later calls are no-ops.
    fn draw(&mut self);

    /// Holder ids of `agency`'s winning wagers.  Only valid after
    /// [`draw`](Self::draw).
    fn winners_for(&self, agency: u32) -> Result<Vec<u32>, StoreError>;
}

/// A ledger that is both store and oracle.
pub trait Ledger: BetStore + WinnerOracle {}

impl<T: BetStore + WinnerOracle> Ledger for T {}

#[derive(Debug, Clone)]
pub struct MemoryLedger {
    winning_number: u32,
    bets: Vec<Wager>,
    /// agency -> winning holder ids, filled by `draw`.
    winners: HashMap<u32, Vec<u32>>,
    drawn: bool,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(DEFAULT_WINNING_NUMBER)
    }
}

impl MemoryLedger {
    pub fn new(winning_number: u32) -> Self {
        Self {
            winning_number,
            bets: Vec::new(),
            winners: HashMap::new(),
            drawn: false,
        }
    }

    pub fn winning_number(&self) -> u32 {
        self.winning_number
    }

    pub fn bets(&self) -> &[Wager] {
        &self.bets
    }

    pub fn is_drawn(&self) -> bool {
        self.drawn
    }
}

impl BetStore for MemoryLedger {
    fn store(&mut self, wagers: &[Wager]) -> Result<(), StoreError> {
        if self.drawn {
            return Err(StoreError::DrawClosed);
        }
        self.bets.extend_from_slice(wagers);
        Ok(())
    }
}

impl WinnerOracle for MemoryLedger {
    fn draw(&mut self) {
        if self.drawn {
            return;
        }
        self.drawn = true;
        let number = self.winning_number;
        for bet in self.bets.iter().filter(|b| b.number == number) {
            self.winners.entry(bet.agency).or_default().push(bet.holder_id);
        }
        log::info!(
            "[ledger] draw winning_number={} bets={} winners={}",
            self.winning_number,
            self.bets.len(),
            self.winners.values().map(Vec::len).sum::<usize>()
        );
    }

    fn winners_for(&self, agency: u32) -> Result<Vec<u32>, StoreError> {
        if !self.drawn {
            return Err(StoreError::NotDrawn);
        }
        Ok(self.winners.get(&agency).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn bet(agency: u32, holder_id: u32, number: u32) -> Wager {
        let date = NaiveDate::from_ymd_opt(1980, 1, 2).unwrap();
        Wager::new(agency, "Ana", "Diaz", holder_id, date, number)
    }

    #[test]
    fn winners_are_scoped_per_agency_in_storage_order() {
        let mut ledger = MemoryLedger::new(7);
        ledger
            .store(&[bet(1, 10, 7), bet(2, 20, 7), bet(1, 11, 3)])
            .unwrap();
        ledger.store(&[bet(1, 12, 7)]).unwrap();
        ledger.draw();

        assert_eq!(ledger.winners_for(1).unwrap(), vec![10, 12]);
        assert_eq!(ledger.winners_for(2).unwrap(), vec![20]);
        assert_eq!(ledger.winners_for(3).unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn winners_before_draw_is_an_error() {
        let ledger = MemoryLedger::default();
        assert_eq!(ledger.winners_for(1), Err(StoreError::NotDrawn));
    }

    #[test]
    fn store_after_draw_is_refused() {
        let mut ledger = MemoryLedger::new(1);
        ledger.draw();
        assert_eq!(ledger.store(&[bet(1, 1, 1)]), Err(StoreError::DrawClosed));
        assert!(ledger.bets().is_empty());
    }

    #[test]
    fn draw_is_idempotent() {
        let mut ledger = MemoryLedger::new(5);
        ledger.store(&[bet(4, 40, 5)]).unwrap();
        ledger.draw();
        ledger.draw();
        assert!(ledger.is_drawn());
        assert_eq!(ledger.winners_for(4).unwrap(), vec![40]);
    }
}
