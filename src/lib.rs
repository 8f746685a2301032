//! Turnstile - Fixed-Window Rate Limiting Gate
//!
//! This crate implements a fixed-window request limiter keyed by caller
//! identity and operation class. Counters live in a pluggable
//! [`store::CounterStore`] whose per-key read-modify-write is atomic, so the
//! admitted count never exceeds the configured ceiling under concurrency.
//! An axum middleware and a small HTTP check service are provided for
//! embedding the gate in front of request handlers.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
