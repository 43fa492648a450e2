//! Conference Client Core Library
//!
//! This library provides the client side of a WebRTC video conference:
//!
//! - WebSocket signaling with heartbeat and resumable/terminal close classification
//! - One publisher per local media kind and one subscriber per remote stream
//! - Race-free single-flight connection creation and deferred teardown
//! - Adaptive quality through multi-stage exponential backoff
//! - TURN credential caching with TTL-based refresh
//!
//! # Architecture
//!
//! Every stateful component is an actor (a task owning its state, driven
//! through a cloneable handle):
//!
//! ```text
//! ConferenceRoom (one per room session)
//! ├── SignalingChannel (WebSocket + heartbeat)
//! └── ConnectionRegistry
//!     ├── QualityBackoffController (shared by publishers)
//!     ├── PublisherConnection (one per local media kind)
//!     └── SubscriberConnection (one per remote media)
//!         └── QualityBackoffController (private)
//! ```
//!
//! Commands flow down through bounded mailboxes; events flow up through
//! unbounded channels so a child never blocks on a parent awaiting it.
//!
//! # Modules
//!
//! - [`room`] - session orchestrator and the application-facing handle
//! - [`registry`] - connection ownership and quality reservations
//! - [`connection`] - publisher/subscriber actors and the peer connection seam
//! - [`signaling`] - WebSocket signaling channel
//! - [`quality`] - backoff state machine and controller
//! - [`turn`] - ICE server source and TURN credential cache
//! - [`api`] - room REST API client
//! - [`config`] - configuration from environment
//! - [`observability`] - metric names and recording helpers
//! - [`errors`] - error types

#![warn(clippy::pedantic)]

pub mod api;
pub mod config;
pub mod connection;
pub mod errors;
pub mod observability;
pub mod quality;
pub mod registry;
pub mod room;
pub mod signaling;
pub mod turn;

mod timing;
