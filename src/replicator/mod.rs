//! The replication session engine.
//!
//! One [`Replicator`] drives one session against one logical replication
//! slot:
//!
//! ```text
//! ┌──────────────┐  payload / status events   ┌──────────────┐
//! │   Consumer   │◄───────────────────────────│  Replicator   │
//! │  (callback)  │     Control::Continue/Stop │  stream loop  │
//! └──────────────┘───────────────────────────►└──────┬───────┘
//!                                                    │ CopyBoth
//!                                                    ▼
//!                                            ┌──────────────┐
//!                                            │  PostgreSQL  │
//!                                            │  (walsender) │
//!                                            └──────────────┘
//! ```
//!
//! The connection is opened lazily; [`Replicator::replicate`] bootstraps the
//! session (identity verification, START_REPLICATION) and runs the receive
//! loop until an exit condition fires. The instance is single-shot: once the
//! loop has run, a new `Replicator` is needed to stream again.
//!
//! # Example
//!
//! ```no_run
//! use pglogstream::{Control, Replicator, StreamEvent};
//!
//! # async fn example() -> pglogstream::Result<()> {
//! let mut replicator = Replicator::from_conninfo(
//!     "host=localhost dbname=app slot=my_slot startpos=0/0",
//! )?;
//!
//! replicator
//!     .replicate(|event| {
//!         match event {
//!             StreamEvent::WalData { wal_start, payload } => {
//!                 println!("{} bytes at {wal_start}", payload.len());
//!             }
//!             StreamEvent::StatusUpdate { acked } => {
//!                 println!("acknowledged up to {acked}");
//!             }
//!         }
//!         Ok(Control::Continue)
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod stream;

pub use stream::{Control, StreamEvent};

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{OptionValue, ReplicatorConfig};
use crate::driver::PgDriver;
use crate::error::{ReplicationError, Result};
use crate::lsn::Lsn;
use crate::progress::Progress;
use crate::protocol::escape::{escape_string, quote_identifier, quote_literal};

/// Client-side engine for one logical replication session.
pub struct Replicator {
    config: ReplicatorConfig,
    driver: Option<PgDriver>,
    progress: Progress,
    identity: Option<SessionIdentity>,
    finished: bool,
    #[cfg(test)]
    test_transport: Option<Box<dyn crate::driver::AsyncStream>>,
}

/// What the server told us about itself during bootstrap.
#[derive(Debug, Clone)]
struct SessionIdentity {
    systemid: String,
    timeline: u32,
    dbname: Option<String>,
    status_interval: Duration,
}

impl Replicator {
    /// Wrap an already-validated configuration.
    pub fn new(config: ReplicatorConfig) -> Replicator {
        Replicator {
            config,
            driver: None,
            progress: Progress::new(),
            identity: None,
            finished: false,
            #[cfg(test)]
            test_transport: None,
        }
    }

    /// Construct from a libpq-style connection string (see
    /// [`ReplicatorConfig::from_conninfo`]).
    pub fn from_conninfo(conninfo: &str) -> Result<Replicator> {
        Ok(Replicator::new(ReplicatorConfig::from_conninfo(conninfo)?))
    }

    /// Construct from a mapping of named options (see
    /// [`ReplicatorConfig::from_options`]).
    pub fn from_options<I, K>(options: I) -> Result<Replicator>
    where
        I: IntoIterator<Item = (K, OptionValue)>,
        K: Into<String>,
    {
        Ok(Replicator::new(ReplicatorConfig::from_options(options)?))
    }

    #[cfg(test)]
    fn with_transport(
        config: ReplicatorConfig,
        stream: Box<dyn crate::driver::AsyncStream>,
    ) -> Replicator {
        let mut r = Replicator::new(config);
        r.test_transport = Some(stream);
        r
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    pub fn host(&self) -> &str {
        self.config.host()
    }

    pub fn port(&self) -> u16 {
        self.config.port()
    }

    /// Configured database name, or the server-reported one once the session
    /// is initialized.
    pub fn dbname(&self) -> Option<&str> {
        self.config
            .dbname()
            .or_else(|| self.identity.as_ref()?.dbname.as_deref())
    }

    pub fn slot(&self) -> &str {
        self.config.slot()
    }

    pub fn start_position(&self) -> Lsn {
        self.config.start_position()
    }

    pub fn end_position(&self) -> Lsn {
        self.config.end_position()
    }

    /// Configured timeline, or the server's once the session is initialized.
    pub fn timeline(&self) -> Option<u32> {
        self.config
            .timeline()
            .or_else(|| Some(self.identity.as_ref()?.timeline))
    }

    /// Configured systemid, or the server's once the session is initialized.
    pub fn systemid(&self) -> Option<&str> {
        self.config
            .systemid()
            .or_else(|| Some(self.identity.as_ref()?.systemid.as_str()))
    }

    /// Effective status interval: the configured value, or the server's
    /// `wal_receiver_status_interval` once the session is initialized.
    pub fn status_interval(&self) -> Option<Duration> {
        self.config
            .status_interval()
            .or_else(|| Some(self.identity.as_ref()?.status_interval))
    }

    pub fn plugin_options(&self) -> &[(String, String)] {
        self.config.plugin_options()
    }

    /// Shared handle for observing progress from another thread while
    /// [`Replicator::replicate`] runs.
    pub fn progress(&self) -> Progress {
        self.progress.clone()
    }

    /// Highest server WAL flush position reported in any received message.
    pub fn last_server_lsn(&self) -> Lsn {
        self.progress.last_server_lsn()
    }

    /// WAL start position of the most recently received data message.
    pub fn last_received_lsn(&self) -> Lsn {
        self.progress.last_received_lsn()
    }

    /// Position of the last payload the consumer accepted.
    pub fn last_processed_lsn(&self) -> Lsn {
        self.progress.last_processed_lsn()
    }

    /// Server-side send time of the last message.
    pub fn last_message_send_time(&self) -> Option<std::time::SystemTime> {
        self.progress.last_message_send_time()
    }

    /// Wall-clock time of the most recent outgoing feedback message.
    pub fn last_status(&self) -> Option<std::time::SystemTime> {
        self.progress.last_status()
    }

    /// True while a connection handle is held.
    pub fn is_connected(&self) -> bool {
        self.driver.is_some()
    }

    /// Bring the session up without entering the stream loop: connect,
    /// verify session invariants and cluster identity, issue
    /// START_REPLICATION and confirm CopyBoth mode.
    ///
    /// [`Replicator::replicate`] calls this lazily; it is public so callers
    /// (and tests) can observe handshake failures in isolation. On any
    /// failure the connection is closed and the handle cleared before the
    /// error surfaces.
    pub async fn initialize_replication(&mut self) -> Result<()> {
        if self.finished {
            return Err(ReplicationError::Session(
                "this replicator already ran; create a new instance to stream again".into(),
            ));
        }
        if self.driver.is_some() {
            return Ok(());
        }

        info!(slot = self.config.slot(), "initializing replication session");
        let mut driver = self.open_driver().await?;
        match bootstrap_session(&self.config, &mut driver).await {
            Ok(identity) => {
                debug!(
                    systemid = %identity.systemid,
                    timeline = identity.timeline,
                    "session bootstrapped"
                );
                self.identity = Some(identity);
                self.driver = Some(driver);
                Ok(())
            }
            Err(e) => {
                driver.close().await;
                Err(e)
            }
        }
    }

    async fn open_driver(&mut self) -> Result<PgDriver> {
        #[cfg(test)]
        if let Some(stream) = self.test_transport.take() {
            return PgDriver::handshake(stream, &self.config).await;
        }
        PgDriver::connect(&self.config).await
    }

    /// Run one replication session, invoking `consumer` with
    /// [`StreamEvent::WalData`] for every WAL payload and
    /// [`StreamEvent::StatusUpdate`] after every feedback message.
    ///
    /// Returns when an exit condition fires: the configured end position is
    /// reached, the server ends the stream, the consumer returns
    /// [`Control::Stop`], or an error occurs. The connection is released on
    /// every path, and the instance cannot stream again afterwards.
    pub async fn replicate<F>(&mut self, mut consumer: F) -> Result<()>
    where
        F: FnMut(StreamEvent<'_>) -> std::result::Result<Control, crate::error::BoxError>,
    {
        self.initialize_replication().await?;

        let result = self.stream_loop(&mut consumer).await;
        if result.is_err() {
            self.flush_last_ack().await;
        }
        self.close().await;
        self.finished = true;
        result
    }

    /// Best-effort wire-only ack of the current processed position, used on
    /// abnormal exits so the server can trim WAL it no longer needs.
    async fn flush_last_ack(&mut self) {
        use crate::protocol::replication::{encode_status_update, pg_epoch_micros_now};

        let Some(driver) = self.driver.as_mut() else {
            return;
        };
        if !driver.in_copy() {
            return;
        }
        let acked = stream::ack_position(self.progress.last_processed_lsn());
        let frame = encode_status_update(acked, pg_epoch_micros_now());
        if let Err(e) = driver.send_copy_data(&frame).await {
            debug!("could not flush final status update: {e}");
        }
    }

    /// Release the underlying connection. Idempotent; a no-op when nothing
    /// is held.
    pub async fn close(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            driver.close().await;
            debug!("replication connection released");
        }
    }
}

/// Bootstrap steps 2-7: secure session state, invariant checks, identity
/// verification, START_REPLICATION.
async fn bootstrap_session(
    config: &ReplicatorConfig,
    driver: &mut PgDriver,
) -> Result<SessionIdentity> {
    // Closes a privilege-escalation vector on shared servers; the call form
    // works on every version that has it (10+).
    if driver.server_version_major().is_some_and(|major| major >= 10) {
        let result = driver
            .simple_query("SELECT pg_catalog.set_config('search_path', '', false)")
            .await?;
        if !result.is_tuples() {
            return Err(ReplicationError::Session(
                "could not clear search_path on this connection".into(),
            ));
        }
    }

    // Timestamp decoding assumes microsecond integer datetimes.
    match driver.parameter("integer_datetimes") {
        Some("on") => {}
        other => {
            return Err(ReplicationError::Session(format!(
                "integer_datetimes must be \"on\", server reports {}",
                other.unwrap_or("nothing")
            )));
        }
    }

    let ident = driver.simple_query("IDENTIFY_SYSTEM").await?;
    let systemid = ident
        .value("systemid")
        .ok_or_else(|| {
            ReplicationError::Protocol("IDENTIFY_SYSTEM returned no systemid".into())
        })?
        .to_string();
    let timeline: u32 = ident
        .value("timeline")
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| {
            ReplicationError::Protocol("IDENTIFY_SYSTEM returned no usable timeline".into())
        })?;
    let dbname = ident.value("dbname").map(str::to_string);

    if let Some(specified) = config.systemid()
        && specified != systemid
    {
        return Err(ReplicationError::IdentityMismatch {
            field: "systemid",
            specified: specified.to_string(),
            reported: systemid,
        });
    }
    if let Some(specified) = config.timeline()
        && specified != timeline
    {
        return Err(ReplicationError::IdentityMismatch {
            field: "timeline",
            specified: specified.to_string(),
            reported: timeline.to_string(),
        });
    }
    // A caller-specified dbname must match the server's report; when the
    // caller left it out, adopt the server's value.
    if let Some(specified) = config.dbname()
        && dbname.as_deref() != Some(specified)
    {
        return Err(ReplicationError::IdentityMismatch {
            field: "dbname",
            specified: specified.to_string(),
            reported: dbname.unwrap_or_else(|| "none".into()),
        });
    }

    let status_interval = match config.status_interval() {
        Some(interval) => interval,
        None => {
            let raw = driver.show("wal_receiver_status_interval").await?;
            parse_guc_duration(&raw)?
        }
    };

    let command = start_replication_command(config);
    driver.start_replication(&command).await?;

    Ok(SessionIdentity {
        systemid,
        timeline,
        dbname,
        status_interval,
    })
}

/// Compose `START_REPLICATION SLOT <slot> LOGICAL <lsn> [(opts)]`.
///
/// The slot name is escaped as a string (quotes doubled, embedded bare, as
/// the walsender grammar expects for ordinary names); option names are
/// quoted as identifiers and values as literals.
fn start_replication_command(config: &ReplicatorConfig) -> String {
    let mut command = format!(
        "START_REPLICATION SLOT {} LOGICAL {}",
        escape_string(config.slot()),
        config.start_position()
    );
    let options = config.plugin_options();
    if !options.is_empty() {
        let rendered: Vec<String> = options
            .iter()
            .map(|(name, value)| format!("{} {}", quote_identifier(name), quote_literal(value)))
            .collect();
        command.push_str(" (");
        command.push_str(&rendered.join(", "));
        command.push(')');
    }
    command
}

/// Parse a GUC interval as printed by SHOW: bare seconds or a value with an
/// `ms`/`s`/`min`/`h`/`d` unit.
fn parse_guc_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let n: u64 = digits.parse().map_err(|_| {
        ReplicationError::Session(format!("unparsable server interval: {raw:?}"))
    })?;
    let duration = match unit.trim() {
        "" | "s" => Duration::from_secs(n),
        "ms" => Duration::from_millis(n),
        "min" => Duration::from_secs(n * 60),
        "h" => Duration::from_secs(n * 3600),
        "d" => Duration::from_secs(n * 86_400),
        other => {
            return Err(ReplicationError::Session(format!(
                "unknown interval unit {other:?} in {raw:?}"
            )));
        }
    };
    if duration.is_zero() {
        // The server has status updates disabled; we still need a wakeup
        // cadence for our own feedback.
        warn!("server wal_receiver_status_interval is 0, defaulting to 10s");
        return Ok(Duration::from_secs(10));
    }
    Ok(duration)
}
