//! `vault-ledger`: the economy ledger.
//!
//! One `accounts` row per subject, created on first touch with the configured
//! starting balance, plus an append-only `ledger_transactions` audit log.
//! Balances are arbitrary-precision integers stored as decimal strings.
//!
//! The ledger never refuses a negative result: callers check sufficiency
//! first (pessimistic pre-check) and then apply (optimistic apply).

pub mod db;
pub mod error;
pub mod ledger;
pub mod types;

pub use error::{LedgerError, Result};
pub use ledger::Ledger;
pub use types::{Account, Cooldown, Currency, Transaction};
