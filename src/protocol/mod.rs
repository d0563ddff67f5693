//! PostgreSQL wire protocol implementation.
//!
//! This module provides low-level primitives for:
//! - Reading and writing PostgreSQL frontend/backend frames ([`framing`])
//! - Parsing query-protocol payloads ([`messages`])
//! - The streaming-replication CopyData sub-protocol ([`replication`])
//! - SQL quoting for command composition ([`escape`])
//!
//! # Wire Protocol Overview
//!
//! PostgreSQL uses a message-based protocol where each message consists of:
//! - 1 byte: message type tag
//! - 4 bytes: message length (including these 4 bytes)
//! - N bytes: message payload
//!
//! Exception: Startup and SSL request messages omit the type tag.
//!
//! # Replication Protocol
//!
//! During logical replication, the server sends CopyData messages containing
//! either `XLogData` (WAL changes) or `PrimaryKeepAlive` (heartbeats). The
//! client responds with Standby Status Update messages to report progress.

pub mod escape;
pub mod framing;
pub mod messages;
pub mod replication;

pub use escape::{escape_string, quote_identifier, quote_literal};
pub use framing::BackendFrame;
pub use messages::{ErrorFields, parse_auth_request, parse_error_response};
pub use replication::{
    PG_EPOCH_UNIX_SECS, WalMessage, decode_wal_message, encode_status_update,
    pg_epoch_micros_now, pg_micros_to_unix_micros, system_time_from_unix_micros,
};
