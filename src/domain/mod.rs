//! Core domain types and logic.

pub mod attribution;
pub mod config_validation;
pub mod error;
pub mod leg;
pub mod leverage;
pub mod matcher;
pub mod matrix;
pub mod payload;
pub mod performance;
pub mod position;
pub mod reconcile;
pub mod session;
pub mod snapshot;
pub mod strategy;
pub mod symbol;
pub mod timeutil;
pub mod trade;
