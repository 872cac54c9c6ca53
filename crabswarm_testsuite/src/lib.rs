//! Testing utilities for crabswarm runs.
//!
//! This crate provides a scripted HTTP client and ready-made iterations so
//! engine behaviour can be tested without a network, under
//! `tokio::time::pause()`.

pub mod suite;

pub use suite::*;
