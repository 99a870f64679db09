//! Core domain + application logic for the wren social bot.
//!
//! This crate is intentionally service-agnostic. The remote social network
//! lives behind the `SocialPort` trait implemented by adapter crates; this
//! crate owns the interaction ledger, the rate limiter, the retry executor,
//! the reconciliation passes and the cron job driver.

pub mod config;
pub mod domain;
pub mod errors;
pub mod health;
pub mod ledger;
pub mod logging;
pub mod ports;
pub mod poster;
pub mod reconciler;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod throttle;

pub use errors::{Error, Result};
