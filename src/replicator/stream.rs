//! The copy-both stream loop and feedback emitter.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use super::Replicator;
use crate::driver::{Incoming, PgDriver};
use crate::error::{BoxError, ReplicationError, Result};
use crate::lsn::Lsn;
use crate::progress::Progress;
use crate::protocol::replication::{
    WalMessage, decode_wal_message, encode_status_update, pg_epoch_micros_now,
    pg_micros_to_unix_micros,
};

/// One delivery to the consumer callback.
#[derive(Debug)]
pub enum StreamEvent<'a> {
    /// A WAL data payload, verbatim from the output plugin.
    WalData { wal_start: Lsn, payload: &'a [u8] },
    /// A Standby Status Update was just sent; usable as a progress or
    /// heartbeat trigger.
    StatusUpdate { acked: Lsn },
}

/// Consumer verdict after each event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    /// Exit the stream loop. The payload that carried this verdict is not
    /// acknowledged; use `end_position` to stop with acknowledgement.
    Stop,
}

enum ExitReason {
    /// `end_position` was crossed by processed, received or server LSN.
    EndPosition,
    /// The server concluded the copy stream.
    StreamClosed,
    /// The consumer asked to stop.
    ConsumerStop,
}

impl Replicator {
    pub(super) async fn stream_loop<F>(&mut self, consumer: &mut F) -> Result<()>
    where
        F: FnMut(StreamEvent<'_>) -> std::result::Result<Control, BoxError>,
    {
        let status_interval = self.status_interval().ok_or_else(|| {
            ReplicationError::Session("stream loop entered before bootstrap".into())
        })?;
        let end = self.config.end_position();
        let progress = self.progress.clone();
        let driver = self.driver.as_mut().ok_or_else(|| {
            ReplicationError::Session("stream loop entered without a connection".into())
        })?;

        // None = no feedback sent yet, due immediately.
        let mut last_status_at: Option<Instant> = None;

        let exit = loop {
            let status_due = last_status_at.is_none_or(|t| t.elapsed() >= status_interval);
            if status_due {
                if emit_feedback(driver, &progress, consumer).await? == Control::Stop {
                    break ExitReason::ConsumerStop;
                }
                last_status_at = Some(Instant::now());
            }

            if !end.is_zero() && progress.last_processed_lsn() >= end {
                break ExitReason::EndPosition;
            }

            // Bounded by the time until the next feedback is due, so an idle
            // stream still acknowledges on schedule.
            let wait = last_status_at
                .map_or(status_interval, |t| {
                    status_interval.saturating_sub(t.elapsed())
                })
                .max(Duration::from_millis(1));

            let frame = match driver.recv_replication_frame(wait).await? {
                Incoming::Idle => continue,
                Incoming::Closed { tag } => {
                    debug!(tag = tag.as_deref().unwrap_or(""), "stream finished");
                    break ExitReason::StreamClosed;
                }
                Incoming::Data(frame) => frame,
            };

            match decode_wal_message(frame)? {
                WalMessage::PrimaryKeepAlive {
                    server_lsn,
                    send_time_micros,
                    reply_requested,
                } => {
                    trace!(%server_lsn, reply_requested, "keepalive");
                    // server_lsn 0 means "no update"
                    if !server_lsn.is_zero() {
                        progress.advance_server_lsn(server_lsn);
                    }
                    progress.record_message_send_micros(pg_micros_to_unix_micros(
                        send_time_micros,
                    ));
                    if reply_requested {
                        if emit_feedback(driver, &progress, consumer).await? == Control::Stop {
                            break ExitReason::ConsumerStop;
                        }
                        last_status_at = Some(Instant::now());
                    }
                    if !end.is_zero() && progress.last_server_lsn() >= end {
                        break ExitReason::EndPosition;
                    }
                }
                WalMessage::XLogData {
                    wal_start,
                    server_lsn,
                    send_time_micros,
                    payload,
                } => {
                    trace!(%wal_start, bytes = payload.len(), "wal data");
                    if !wal_start.is_zero() {
                        progress.advance_received_lsn(wal_start);
                    }
                    if !server_lsn.is_zero() {
                        progress.advance_server_lsn(server_lsn);
                    }
                    progress.record_message_send_micros(pg_micros_to_unix_micros(
                        send_time_micros,
                    ));

                    if !end.is_zero() && progress.last_received_lsn() > end {
                        debug!(
                            %wal_start,
                            end_position = %end,
                            "payload beyond end position, not delivering"
                        );
                        break ExitReason::EndPosition;
                    }

                    match consumer(StreamEvent::WalData {
                        wal_start,
                        payload: &payload,
                    }) {
                        Ok(Control::Continue) => {
                            progress.advance_processed_lsn(progress.last_received_lsn());
                        }
                        Ok(Control::Stop) => break ExitReason::ConsumerStop,
                        Err(e) => return Err(ReplicationError::Consumer(e)),
                    }
                }
            }
        };

        match exit {
            ExitReason::EndPosition => {
                debug!(end_position = %end, "end position reached");
                emit_feedback(driver, &progress, consumer).await?;
            }
            ExitReason::ConsumerStop => {
                debug!("consumer requested stop");
                // Final ack without another consumer notification.
                let acked = ack_position(progress.last_processed_lsn());
                let now_micros = pg_epoch_micros_now();
                if let Err(e) = driver
                    .send_copy_data(&encode_status_update(acked, now_micros))
                    .await
                {
                    debug!("could not send final status update: {e}");
                } else {
                    progress.record_status_micros(pg_micros_to_unix_micros(now_micros));
                }
            }
            // Copy mode is over; there is no channel left to ack on.
            ExitReason::StreamClosed => {}
        }
        Ok(())
    }
}

/// The acknowledged position: one past the processed byte, or 0 before
/// anything was processed. The server reads the ack as "everything strictly
/// before this position is durable".
pub(super) fn ack_position(processed: Lsn) -> Lsn {
    if processed.is_zero() {
        Lsn::ZERO
    } else {
        Lsn(processed.0 + 1)
    }
}

/// Write one Standby Status Update, stamp `last_status`, and notify the
/// consumer.
async fn emit_feedback<F>(
    driver: &mut PgDriver,
    progress: &Progress,
    consumer: &mut F,
) -> Result<Control>
where
    F: FnMut(StreamEvent<'_>) -> std::result::Result<Control, BoxError>,
{
    let acked = ack_position(progress.last_processed_lsn());
    let now_micros = pg_epoch_micros_now();
    driver
        .send_copy_data(&encode_status_update(acked, now_micros))
        .await?;
    progress.record_status_micros(pg_micros_to_unix_micros(now_micros));
    trace!(%acked, "sent standby status update");

    consumer(StreamEvent::StatusUpdate { acked }).map_err(ReplicationError::Consumer)
}
