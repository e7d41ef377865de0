//! Core domain types and logic.

pub mod error;
pub mod holdings;
pub mod cusip;
pub mod weights;
pub mod portfolio;
pub mod rebalance;
pub mod calendar;
pub mod backtest;
pub mod config_validation;
