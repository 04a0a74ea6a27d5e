//! Turnstile - Request Admission Control
//!
//! This crate bounds the rate of incoming operations per actor with
//! fixed-window counters kept in a shared, TTL-expiring counter store. A
//! [`gate::RateLimitGate`] resolves who is calling, picks the applicable
//! limit and asks the [`ratelimit::ThrottleEngine`], which fails open when
//! the store cannot answer.

pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod identity;
pub mod ratelimit;
pub mod store;
