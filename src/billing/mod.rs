//! Retainer billing engine.
//!
//! - `period`: calendar months and inclusive billing periods
//! - `agreement`: which agreement governs a month
//! - `balance`: the month-by-month hour ledger
//! - `allocation`: splitting time entries across retainer pools
//! - `invoice`: invoice assembly and the store-backed operations
//! - `audit`: append-only record of invoice lifecycle events

pub mod agreement;
pub mod allocation;
pub mod audit;
pub mod balance;
pub mod invoice;
pub mod period;
