//! The CopyData sub-protocol of streaming replication.
//!
//! Inside CopyBoth mode the server sends two message kinds, identified by
//! the first payload byte:
//!
//! | ID    | Name             | Body (big-endian)                                  |
//! |-------|------------------|----------------------------------------------------|
//! | `'w'` | XLogData         | wal_start u64, server_lsn u64, send_time u64, data |
//! | `'k'` | PrimaryKeepAlive | server_lsn u64, send_time u64, reply_requested u8  |
//!
//! The client answers with Standby Status Update (`'r'`) frames carrying the
//! acknowledged write/flush/apply LSNs and a client timestamp. Timestamps on
//! this protocol are microseconds since 2000-01-01 00:00:00 UTC.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ReplicationError, Result};
use crate::lsn::Lsn;

/// 2000-01-01 00:00:00 UTC in Unix seconds.
pub const PG_EPOCH_UNIX_SECS: i64 = 946_684_800;

/// Total size of a Standby Status Update frame.
pub const STATUS_UPDATE_LEN: usize = 1 + 8 * 4 + 1;

/// A decoded server→client replication message.
#[derive(Debug, Clone)]
pub enum WalMessage {
    XLogData {
        wal_start: Lsn,
        server_lsn: Lsn,
        send_time_micros: i64,
        payload: Bytes,
    },
    PrimaryKeepAlive {
        server_lsn: Lsn,
        send_time_micros: i64,
        reply_requested: bool,
    },
}

/// Decode one CopyData payload into a [`WalMessage`].
///
/// Any identifier other than `'w'` / `'k'` is a fatal protocol error.
pub fn decode_wal_message(payload: Bytes) -> Result<WalMessage> {
    if payload.is_empty() {
        return Err(ReplicationError::Protocol(
            "empty replication message".into(),
        ));
    }
    let mut b = payload;
    let kind = b.get_u8();
    match kind {
        b'w' => {
            if b.remaining() < 8 + 8 + 8 {
                return Err(ReplicationError::Protocol(
                    "XLogData message too short".into(),
                ));
            }
            let wal_start = Lsn(b.get_u64());
            let server_lsn = Lsn(b.get_u64());
            let send_time_micros = b.get_i64();
            let payload = b.copy_to_bytes(b.remaining());
            Ok(WalMessage::XLogData {
                wal_start,
                server_lsn,
                send_time_micros,
                payload,
            })
        }
        b'k' => {
            if b.remaining() < 8 + 8 + 1 {
                return Err(ReplicationError::Protocol(
                    "keepalive message too short".into(),
                ));
            }
            let server_lsn = Lsn(b.get_u64());
            let send_time_micros = b.get_i64();
            let reply_requested = b.get_u8() == 1;
            Ok(WalMessage::PrimaryKeepAlive {
                server_lsn,
                send_time_micros,
                reply_requested,
            })
        }
        _ => Err(ReplicationError::Protocol(format!(
            "unknown replication message identifier: 0x{kind:02X}"
        ))),
    }
}

/// Encode a Standby Status Update.
///
/// Write, flush and apply all carry `ack`: this engine does not distinguish
/// receive/persist/apply stages, the consumer is expected to have made the
/// payload durable before returning from its callback. The reply-requested
/// flag is always zero.
pub fn encode_status_update(ack: Lsn, client_time_micros: i64) -> BytesMut {
    let mut out = BytesMut::with_capacity(STATUS_UPDATE_LEN);
    out.put_u8(b'r');
    out.put_u64(ack.0);
    out.put_u64(ack.0);
    out.put_u64(ack.0);
    out.put_i64(client_time_micros);
    out.put_u8(0);
    out
}

/// Current wall-clock time as PostgreSQL-epoch microseconds.
pub fn pg_epoch_micros_now() -> i64 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let unix_micros = (unix.as_secs() as i64) * 1_000_000 + i64::from(unix.subsec_micros());
    unix_micros - PG_EPOCH_UNIX_SECS * 1_000_000
}

/// PostgreSQL-epoch microseconds → Unix-epoch microseconds.
pub fn pg_micros_to_unix_micros(micros: i64) -> i64 {
    micros + PG_EPOCH_UNIX_SECS * 1_000_000
}

/// Unix-epoch microseconds → [`SystemTime`], preserving microsecond
/// resolution.
pub fn system_time_from_unix_micros(unix_micros: i64) -> SystemTime {
    if unix_micros >= 0 {
        UNIX_EPOCH + Duration::from_micros(unix_micros as u64)
    } else {
        UNIX_EPOCH - Duration::from_micros(unix_micros.unsigned_abs())
    }
}
