//! Observability for the conference client.
//!
//! Structured logging uses `tracing` with `cc.*` targets; see
//! [`common::observability::init_tracing`] for subscriber setup.

pub mod metrics;
