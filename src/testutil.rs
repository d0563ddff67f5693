//! Scripted-walsender helpers for protocol-level tests.
//!
//! Tests drive a [`Replicator`](crate::Replicator) or
//! [`PgDriver`](crate::driver::PgDriver) over one half of a
//! `tokio::io::duplex` pipe while these helpers play the server on the
//! other half.

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// One tagged backend/frontend frame.
pub fn msg(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(5 + body.len());
    v.push(tag);
    v.extend_from_slice(&((4 + body.len()) as i32).to_be_bytes());
    v.extend_from_slice(body);
    v
}

pub fn cstr(s: &str) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    v
}

pub fn param_status(name: &str, value: &str) -> Vec<u8> {
    let mut body = cstr(name);
    body.extend_from_slice(&cstr(value));
    msg(b'S', &body)
}

pub fn error_response(message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(b'M');
    body.extend_from_slice(&cstr(message));
    body.push(0);
    msg(b'E', &body)
}

/// Read the (untagged) startup message, returning its body.
pub async fn read_startup(io: &mut DuplexStream) -> Vec<u8> {
    let mut len = [0u8; 4];
    io.read_exact(&mut len).await.unwrap();
    let mut body = vec![0u8; i32::from_be_bytes(len) as usize - 4];
    io.read_exact(&mut body).await.unwrap();
    body
}

/// Read one tagged frontend frame.
pub async fn expect_frontend(io: &mut DuplexStream) -> (u8, Vec<u8>) {
    let mut hdr = [0u8; 5];
    io.read_exact(&mut hdr).await.unwrap();
    let len = i32::from_be_bytes(hdr[1..5].try_into().unwrap()) as usize;
    let mut body = vec![0u8; len - 4];
    io.read_exact(&mut body).await.unwrap();
    (hdr[0], body)
}

/// Read a Query frame and return its SQL text.
pub async fn expect_query(io: &mut DuplexStream) -> String {
    let (tag, body) = expect_frontend(io).await;
    assert_eq!(tag, b'Q', "expected a Query frame");
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    String::from_utf8_lossy(&body[..end]).to_string()
}

/// Accept the startup message with trust auth and the given session
/// parameters, ending in ReadyForQuery(idle).
pub async fn accept_startup_with(io: &mut DuplexStream, parameters: &[(&str, &str)]) {
    let startup = read_startup(io).await;
    let text = String::from_utf8_lossy(&startup);
    assert!(
        text.contains("replication\0database"),
        "startup did not request replication mode: {text:?}"
    );

    let mut out = msg(b'R', &0i32.to_be_bytes());
    for (name, value) in parameters {
        out.extend_from_slice(&param_status(name, value));
    }
    out.extend_from_slice(&msg(b'K', &[0u8; 8]));
    out.extend_from_slice(&msg(b'Z', b"I"));
    io.write_all(&out).await.unwrap();
}

/// [`accept_startup_with`] using a modern server's defaults.
pub async fn accept_startup(io: &mut DuplexStream) {
    accept_startup_with(
        io,
        &[("server_version", "16.4"), ("integer_datetimes", "on")],
    )
    .await;
}

/// Answer the pending query with a tuples result, then ReadyForQuery.
pub async fn send_query_result(
    io: &mut DuplexStream,
    columns: &[&str],
    rows: &[&[Option<&str>]],
) {
    let mut rowdesc = Vec::new();
    rowdesc.extend_from_slice(&(columns.len() as i16).to_be_bytes());
    for name in columns {
        rowdesc.extend_from_slice(&cstr(name));
        rowdesc.extend_from_slice(&[0u8; 18]);
    }
    let mut out = msg(b'T', &rowdesc);
    for row in rows {
        let mut datarow = Vec::new();
        datarow.extend_from_slice(&(row.len() as i16).to_be_bytes());
        for value in *row {
            match value {
                Some(v) => {
                    datarow.extend_from_slice(&(v.len() as i32).to_be_bytes());
                    datarow.extend_from_slice(v.as_bytes());
                }
                None => datarow.extend_from_slice(&(-1i32).to_be_bytes()),
            }
        }
        out.extend_from_slice(&msg(b'D', &datarow));
    }
    out.extend_from_slice(&msg(b'C', &cstr(&format!("SELECT {}", rows.len()))));
    out.extend_from_slice(&msg(b'Z', b"I"));
    io.write_all(&out).await.unwrap();
}

/// Expect a START_REPLICATION query, answer CopyBothResponse, and return
/// the command for assertions.
pub async fn enter_copy_both(io: &mut DuplexStream) -> String {
    let command = expect_query(io).await;
    assert!(
        command.starts_with("START_REPLICATION SLOT"),
        "unexpected command: {command}"
    );
    // format 0, zero columns
    io.write_all(&msg(b'W', &[0, 0, 0])).await.unwrap();
    command
}

pub async fn send_keepalive(io: &mut DuplexStream, server_lsn: u64, micros: i64, reply: u8) {
    let mut body = Vec::with_capacity(18);
    body.push(b'k');
    body.extend_from_slice(&server_lsn.to_be_bytes());
    body.extend_from_slice(&micros.to_be_bytes());
    body.push(reply);
    io.write_all(&msg(b'd', &body)).await.unwrap();
}

pub async fn send_xlog(
    io: &mut DuplexStream,
    wal_start: u64,
    server_lsn: u64,
    micros: i64,
    payload: &[u8],
) {
    let mut body = Vec::with_capacity(25 + payload.len());
    body.push(b'w');
    body.extend_from_slice(&wal_start.to_be_bytes());
    body.extend_from_slice(&server_lsn.to_be_bytes());
    body.extend_from_slice(&micros.to_be_bytes());
    body.extend_from_slice(payload);
    io.write_all(&msg(b'd', &body)).await.unwrap();
}

/// A decoded Standby Status Update from the client.
#[derive(Debug, Clone, Copy)]
pub struct StatusUpdate {
    pub write: u64,
    pub flush: u64,
    pub apply: u64,
    pub client_time: i64,
    pub reply_requested: u8,
}

/// Read one client CopyData frame and decode the status update inside.
pub async fn read_status_update(io: &mut DuplexStream) -> StatusUpdate {
    let (tag, body) = expect_frontend(io).await;
    assert_eq!(tag, b'd', "expected CopyData from client");
    assert_eq!(body[0], b'r', "expected a status update");
    assert_eq!(body.len(), 34);
    StatusUpdate {
        write: u64::from_be_bytes(body[1..9].try_into().unwrap()),
        flush: u64::from_be_bytes(body[9..17].try_into().unwrap()),
        apply: u64::from_be_bytes(body[17..25].try_into().unwrap()),
        client_time: i64::from_be_bytes(body[25..33].try_into().unwrap()),
        reply_requested: body[33],
    }
}

/// End the copy stream: CopyDone, wait for the client's CopyDone, then
/// CommandComplete + ReadyForQuery.
pub async fn finish_copy(io: &mut DuplexStream) {
    io.write_all(&msg(b'c', &[])).await.unwrap();
    let (tag, _) = expect_frontend(io).await;
    assert_eq!(tag, b'c', "expected CopyDone from client");
    let mut out = msg(b'C', &cstr("COPY 0"));
    out.extend_from_slice(&msg(b'Z', b"I"));
    io.write_all(&out).await.unwrap();
}
