//! QuotaGuard - Distributed Rate Limiting and Admission Control
//!
//! This crate enforces per-identifier request quotas over a sliding time
//! window, consistently across many service instances, backed by a single
//! shared Redis store. Repeat offenders can be escalated into a time-bounded
//! block that short-circuits the window check entirely.
//!
//! The crate is a library: the protocol adapter that extracts an identifier
//! from an inbound request and renders a 429 response consumes the
//! [`limiter::RateLimiter`] surface (`check`, `peek`, `reset`, `block`,
//! `unblock`) and decides fail-open vs fail-closed when the store is down.

pub mod config;
pub mod error;
pub mod limiter;
pub mod store;
