//! Shared replication progress counters.
//!
//! The stream loop writes these; any other thread may read them through a
//! cloned [`Progress`] handle while the loop runs. Each field is an
//! independent 64-bit atomic. There is no cross-field snapshot: an observer
//! can see `last_received_lsn` ahead of `last_processed_lsn` mid-delivery,
//! which is expected.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::SystemTime;

use crate::lsn::Lsn;
use crate::protocol::replication::system_time_from_unix_micros;

#[derive(Debug, Default)]
struct ProgressState {
    last_server_lsn: AtomicU64,
    last_received_lsn: AtomicU64,
    last_processed_lsn: AtomicU64,
    /// Unix-epoch microseconds of the last server message's send time;
    /// 0 = no message seen yet.
    last_message_send_micros: AtomicI64,
    /// Unix-epoch microseconds of the last outgoing feedback; 0 = none yet.
    last_status_micros: AtomicI64,
}

/// Cloneable handle onto one session's progress counters.
///
/// All LSNs start at [`Lsn::ZERO`] and are monotonically non-decreasing once
/// non-zero.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    state: Arc<ProgressState>,
}

impl Progress {
    pub(crate) fn new() -> Self {
        Progress::default()
    }

    /// Highest WAL flush position the server has reported.
    pub fn last_server_lsn(&self) -> Lsn {
        Lsn(self.state.last_server_lsn.load(Ordering::Relaxed))
    }

    /// WAL start position of the most recently received data message.
    pub fn last_received_lsn(&self) -> Lsn {
        Lsn(self.state.last_received_lsn.load(Ordering::Relaxed))
    }

    /// Position of the last payload the consumer accepted.
    pub fn last_processed_lsn(&self) -> Lsn {
        Lsn(self.state.last_processed_lsn.load(Ordering::Relaxed))
    }

    /// Server-side send time of the last message, as wall-clock time.
    pub fn last_message_send_time(&self) -> Option<SystemTime> {
        match self.state.last_message_send_micros.load(Ordering::Relaxed) {
            0 => None,
            micros => Some(system_time_from_unix_micros(micros)),
        }
    }

    /// Wall-clock time of the most recent outgoing feedback message.
    pub fn last_status(&self) -> Option<SystemTime> {
        match self.state.last_status_micros.load(Ordering::Relaxed) {
            0 => None,
            micros => Some(system_time_from_unix_micros(micros)),
        }
    }

    pub(crate) fn advance_server_lsn(&self, lsn: Lsn) {
        self.state
            .last_server_lsn
            .fetch_max(lsn.0, Ordering::Relaxed);
    }

    pub(crate) fn advance_received_lsn(&self, lsn: Lsn) {
        self.state
            .last_received_lsn
            .fetch_max(lsn.0, Ordering::Relaxed);
    }

    pub(crate) fn advance_processed_lsn(&self, lsn: Lsn) {
        self.state
            .last_processed_lsn
            .fetch_max(lsn.0, Ordering::Relaxed);
    }

    pub(crate) fn record_message_send_micros(&self, unix_micros: i64) {
        self.state
            .last_message_send_micros
            .store(unix_micros, Ordering::Relaxed);
    }

    pub(crate) fn record_status_micros(&self, unix_micros: i64) {
        self.state
            .last_status_micros
            .store(unix_micros, Ordering::Relaxed);
    }
}
