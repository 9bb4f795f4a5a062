//! Retainer balance and time-allocation engine.
//!
//! Resolves which retainer agreement governs each month, folds logged time
//! into monthly hour balances with rollover and negative carry-forward, splits
//! time entries across retainer pools, and assembles invoices from the result.

pub mod billing;
pub mod config;
pub mod db;
pub mod error;
pub mod settings;
pub mod web;

#[cfg(test)]
pub mod testing;
