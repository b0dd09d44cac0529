//! Integration suite: the full platform wired with a scripted payment rail
//! and a fault-injecting ledger.

mod common;
mod concurrency;
mod money_flow;
mod settlement_flow;
