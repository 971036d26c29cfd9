//! Clinic ledger - invoices, payments and refunds with exact integer money,
//! idempotent payment confirmation and an aggregate reconciliation check.

pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod startup;

pub use error::{LedgerError, Result};
pub use startup::{Application, LedgerEngine};
