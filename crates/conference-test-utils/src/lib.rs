//! # Conference Test Utilities
//!
//! Shared test utilities for the conference client.
//!
//! This crate provides mock implementations and fixtures for testing the
//! client without a media engine or a real signaling server.
//!
//! ## Modules
//!
//! - `mock_peer` - Mock peer connection and factory (records tracks and
//!   encodings, injectable events and stats, creation gate for race tests)
//! - `mock_signaling` - WebSocket signaling server on `127.0.0.1:0` with
//!   scripted echo replies and close codes
//! - `fixtures` - Static ICE servers, participants, streams, room API mocks
//!
//! ## Usage
//!
//! ```rust,ignore
//! use conference_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let factory = MockPeerConnectionFactory::new();
//!     factory.hold_creations();
//!
//!     let (registry, _events, _outbound) = spawn_test_registry(factory.clone());
//!     // ... race ensure_connection against unsubscribe ...
//!     factory.release_creations();
//! }
//! ```

pub mod fixtures;
pub mod mock_peer;
pub mod mock_signaling;

pub use fixtures::*;
pub use mock_peer::*;
pub use mock_signaling::*;
