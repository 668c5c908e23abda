//! Escrow settlement engine for a gift-card marketplace.
//!
//! Turns two users' intent to swap or sell gift cards into a safely
//! finalized exchange of secret codes and money: lifecycle state machines
//! for trades and sales, fee accounting over an append-only ledger, escrow
//! custody with exactly-once secret release, and a timed confirmation
//! window that auto-finalizes silent trades.

pub mod card;
pub mod config;
pub mod dispute;
pub mod error;
pub mod escrow;
pub mod event;
pub mod ledger;
pub mod money;
pub mod policy;
pub mod sale;
pub mod scheduler;
pub mod service;
pub mod trade;
pub mod utils;
pub mod vault;
