//! wager_ledger: betting ledger and settlement engine for head-to-head matches.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod api;
pub mod clock;
pub mod config;
pub mod engine;
pub mod events;
pub mod ledger;
pub mod odds;
pub mod rails;
pub mod risk;
pub mod storage;
pub mod types;
