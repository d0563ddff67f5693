//! # pglogstream
//!
//! A Tokio-based client engine for PostgreSQL logical replication streaming.
//!
//! One [`Replicator`] drives one session against one existing logical
//! replication slot: it opens a replication-mode connection, verifies the
//! cluster identity (`IDENTIFY_SYSTEM`), issues `START_REPLICATION`, and
//! runs the CopyBoth loop, handing every decoded WAL payload to a consumer
//! callback verbatim and originating the Standby Status Update feedback
//! that lets the server trim retained WAL.
//!
//! ## Features
//!
//! - **Async/await** - Built on Tokio for high-performance async I/O
//! - **TLS support** - Optional rustls-based encryption with verify modes
//! - **SCRAM-SHA-256** - Secure password authentication
//! - **Plugin-agnostic** - Payloads from `test_decoding`, `pgoutput`,
//!   `wal2json`, ... are delivered as opaque bytes
//! - **Observable progress** - LSN counters readable from other threads
//!   while the loop runs
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pglogstream::{Control, Replicator, StreamEvent};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut replicator = Replicator::from_conninfo(
//!     "host=localhost user=postgres dbname=mydb slot=my_slot",
//! )?;
//!
//! replicator
//!     .replicate(|event| {
//!         match event {
//!             StreamEvent::WalData { wal_start, payload } => {
//!                 println!("{wal_start}: {}", String::from_utf8_lossy(payload));
//!             }
//!             StreamEvent::StatusUpdate { acked } => {
//!                 // good place to persist a checkpoint
//!                 println!("acked {acked}");
//!             }
//!         }
//!         Ok(Control::Continue)
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! Returning normally from the callback acknowledges the payload: the next
//! feedback message reports it processed, which is what advances the
//! slot's `confirmed_flush_lsn`. Make the payload durable before returning.
//!
//! ## Feature Flags
//!
//! - `tls-rustls` (default) - TLS support via rustls
//! - `scram` (default) - SCRAM-SHA-256 authentication
//! - `md5` - MD5 authentication (legacy)

#![warn(
    clippy::all,
    clippy::cargo,
    clippy::perf,
    clippy::style,
    clippy::correctness,
    clippy::suspicious
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::multiple_crate_versions
)]

pub mod auth;
pub mod config;
pub mod driver;
pub mod error;
pub mod lsn;
pub mod progress;
pub mod protocol;
pub mod replicator;
pub mod tls;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{OptionValue, ReplicatorConfig, SslMode, TlsConfig};
pub use error::{BoxError, ReplicationError, Result};
pub use lsn::Lsn;
pub use progress::Progress;
pub use replicator::{Control, Replicator, StreamEvent};
