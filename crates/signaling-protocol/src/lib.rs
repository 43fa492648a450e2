//! Signaling protocol for the conference client.
//!
//! Every WebSocket text frame carries one JSON [`Envelope`]:
//! `{namespace, payload, timestamp?}`. The `media` namespace carries
//! [`media`] actions (SDP exchange, simulcast configuration, link status),
//! the `control` namespace carries roster updates, and `echo` is reserved for
//! heartbeats.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod control;
pub mod envelope;
pub mod media;

pub use codec::CodecError;
pub use envelope::Envelope;
