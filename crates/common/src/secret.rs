//! Secret types for protecting sensitive values from accidental logging.
//!
//! This module re-exports types from the [`secrecy`] crate. Use them for every
//! credential the client handles: room tickets, resumption tokens and TURN
//! passwords.
//!
//! `SecretString` implements `Debug` with redaction, so any struct that derives
//! `Debug` while holding one is safe to pass to `tracing`.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct RoomTicket {
//!     room_id: String,
//!     ticket: SecretString,
//! }
//!
//! let ticket = RoomTicket {
//!     room_id: "standup".to_string(),
//!     ticket: SecretString::from("t-123"),
//! };
//!
//! assert!(!format!("{ticket:?}").contains("t-123"));
//! assert_eq!(ticket.ticket.expose_secret(), "t-123");
//! ```
//!
//! # Serde Integration
//!
//! With the `serde` feature enabled, secrets can be deserialized from JSON
//! responses (the TURN `password` field, the room `ticket`):
//!
//! ```rust
//! use serde::Deserialize;
//! use common::secret::SecretString;
//!
//! #[derive(Debug, Deserialize)]
//! struct TurnEntry {
//!     username: String,
//!     password: SecretString,
//! }
//!
//! let json = r#"{"username": "u-1", "password": "p-1"}"#;
//! let entry: TurnEntry = serde_json::from_str(json).unwrap();
//! assert!(!format!("{entry:?}").contains("p-1"));
//! ```

pub use secrecy::{ExposeSecret, SecretString};
