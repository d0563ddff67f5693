//! The PostgreSQL driver layer.
//!
//! [`PgDriver`] owns one replication-mode connection and exposes exactly
//! what a replication session needs: startup + authentication, simple
//! queries with tabular results (IDENTIFY_SYSTEM, SHOW, SELECT), the
//! CopyBoth transition, and CopyData send/receive with a bounded wait.
//!
//! Receiving is buffered: bytes are accumulated in a [`BytesMut`] and frames
//! are only consumed once complete, so a timed-out wait never tears a frame
//! apart. This is what lets the stream loop wake up to send feedback while
//! the server is idle.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::config::ReplicatorConfig;
use crate::error::{ReplicationError, Result};
use crate::protocol::escape::quote_identifier;
use crate::protocol::framing::{self, decode_frame};
use crate::protocol::messages::{
    parse_auth_request, parse_command_complete, parse_data_row, parse_error_response,
    parse_parameter_status, parse_row_description, ready_for_query_status,
};

#[cfg(not(feature = "tls-rustls"))]
use crate::config::SslMode;

/// Transport the driver runs on. Blanket-implemented; custom transports
/// (unix sockets, in-memory pipes in tests) plug in via
/// [`PgDriver::handshake`].
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Result of a simple query, text format.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub tag: Option<String>,
}

impl QueryResult {
    /// True when the server answered with a tuples result (RowDescription),
    /// even if zero rows followed.
    pub fn is_tuples(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Value of `column` in the first row.
    pub fn value(&self, column: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.first()?.get(idx)?.as_deref()
    }

    /// First column of the first row.
    pub fn first_value(&self) -> Option<&str> {
        self.rows.first()?.first()?.as_deref()
    }
}

/// One receive step inside CopyBoth mode.
#[derive(Debug)]
pub enum Incoming {
    /// A CopyData payload.
    Data(Bytes),
    /// Nothing arrived within the wait budget.
    Idle,
    /// The server ended the copy stream; `tag` is the final CommandComplete
    /// tag when one was seen.
    Closed { tag: Option<String> },
}

pub struct PgDriver {
    stream: Box<dyn AsyncStream>,
    rx: BytesMut,
    parameters: BTreeMap<String, String>,
    in_copy: bool,
    terminated: bool,
}

impl std::fmt::Debug for PgDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgDriver")
            .field("parameters", &self.parameters)
            .field("in_copy", &self.in_copy)
            .field("terminated", &self.terminated)
            .finish()
    }
}

impl PgDriver {
    /// Open a TCP (optionally TLS) connection and run the startup/auth
    /// handshake.
    pub async fn connect(config: &ReplicatorConfig) -> Result<PgDriver> {
        let tcp = TcpStream::connect((config.host(), config.port()))
            .await
            .map_err(|e| {
                ReplicationError::Connection(format!(
                    "connect {}:{}: {e}",
                    config.host(),
                    config.port()
                ))
            })?;
        tcp.set_nodelay(true)?;

        #[cfg(feature = "tls-rustls")]
        let stream: Box<dyn AsyncStream> = {
            use crate::tls::rustls::{MaybeTlsStream, maybe_upgrade};
            match maybe_upgrade(tcp, config.tls(), config.host()).await? {
                MaybeTlsStream::Plain(s) => Box::new(s),
                MaybeTlsStream::Tls(s) => s,
            }
        };

        #[cfg(not(feature = "tls-rustls"))]
        let stream: Box<dyn AsyncStream> = {
            match config.tls().mode {
                SslMode::Disable | SslMode::Prefer => {}
                _ => {
                    return Err(ReplicationError::Tls(
                        "tls-rustls feature disabled but sslmode requires TLS".into(),
                    ));
                }
            }
            Box::new(tcp)
        };

        Self::handshake(stream, config).await
    }

    /// Run the startup/auth handshake on an established transport.
    pub async fn handshake(
        stream: Box<dyn AsyncStream>,
        config: &ReplicatorConfig,
    ) -> Result<PgDriver> {
        let mut driver = PgDriver {
            stream,
            rx: BytesMut::with_capacity(8 * 1024),
            parameters: BTreeMap::new(),
            in_copy: false,
            terminated: false,
        };

        let mut params = vec![
            ("user", config.user()),
            ("replication", "database"),
            ("client_encoding", "UTF8"),
            ("application_name", config.application_name()),
        ];
        if let Some(db) = config.dbname() {
            params.push(("database", db));
        }
        driver.send(&framing::startup_message(params)).await?;

        loop {
            let frame = driver.read_frame().await?;
            match frame.tag {
                b'R' => {
                    let (code, rest) = parse_auth_request(&frame.payload)?;
                    driver.answer_auth_request(config, code, rest).await?;
                }
                b'E' => {
                    return Err(ReplicationError::Connection(parse_error_response(
                        &frame.payload,
                    )));
                }
                b'S' => driver.record_parameter(&frame.payload)?,
                b'K' => {} // BackendKeyData, unused: no query cancellation on this connection
                b'N' => debug!(notice = %parse_error_response(&frame.payload), "server notice"),
                b'Z' => {
                    let status = ready_for_query_status(&frame.payload)?;
                    if status != b'I' {
                        return Err(ReplicationError::Connection(format!(
                            "connection not idle after startup (status {:?})",
                            status as char
                        )));
                    }
                    break;
                }
                other => {
                    debug!(tag = %(other as char), "ignoring startup-phase message");
                }
            }
        }

        debug!(
            server_version = driver.parameter("server_version").unwrap_or("unknown"),
            "replication connection established"
        );
        Ok(driver)
    }

    async fn answer_auth_request(
        &mut self,
        config: &ReplicatorConfig,
        code: i32,
        payload: &[u8],
    ) -> Result<()> {
        match code {
            0 => Ok(()), // AuthenticationOk
            3 => {
                let mut p = Vec::from(config.password().as_bytes());
                p.push(0);
                self.send(&framing::password_message(&p)).await
            }
            10 => self.auth_sasl(config, payload).await,
            #[cfg(feature = "md5")]
            5 => {
                if payload.len() < 4 {
                    return Err(ReplicationError::Protocol("md5 auth salt missing".into()));
                }
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&payload[..4]);
                let hashed = crate::auth::md5_password(config.user(), config.password(), &salt);
                let mut p = hashed.into_bytes();
                p.push(0);
                self.send(&framing::password_message(&p)).await
            }
            other => Err(ReplicationError::Auth(format!(
                "unsupported auth method: {other}"
            ))),
        }
    }

    #[cfg(not(feature = "scram"))]
    async fn auth_sasl(&mut self, _config: &ReplicatorConfig, _mechanisms: &[u8]) -> Result<()> {
        Err(ReplicationError::Auth(
            "server requires SASL but the scram feature is disabled".into(),
        ))
    }

    #[cfg(feature = "scram")]
    async fn auth_sasl(&mut self, config: &ReplicatorConfig, mechanisms: &[u8]) -> Result<()> {
        use crate::auth::ScramExchange;

        let offered: Vec<&str> = mechanisms
            .split(|&b| b == 0)
            .filter(|m| !m.is_empty())
            .filter_map(|m| std::str::from_utf8(m).ok())
            .collect();
        if !offered.contains(&"SCRAM-SHA-256") {
            return Err(ReplicationError::Auth(format!(
                "server does not offer SCRAM-SHA-256: {offered:?}"
            )));
        }

        let exchange = ScramExchange::begin(config.user());

        // SASLInitialResponse rides in a PasswordMessage:
        // mechanism\0 + int32(len) + initial-response bytes
        let first = exchange.client_first();
        let mut init = Vec::with_capacity(14 + 4 + first.len());
        init.extend_from_slice(b"SCRAM-SHA-256");
        init.push(0);
        init.extend_from_slice(&(first.len() as i32).to_be_bytes());
        init.extend_from_slice(first.as_bytes());
        self.send(&framing::password_message(&init)).await?;

        // AuthenticationSASLContinue (code 11)
        let server_first = self.read_auth_payload(11).await?;
        let server_first = String::from_utf8_lossy(&server_first).to_string();

        let (client_final, proof) = exchange.finish(config.password(), &server_first)?;
        self.send(&framing::password_message(client_final.as_bytes()))
            .await?;

        // AuthenticationSASLFinal (code 12)
        let server_final = self.read_auth_payload(12).await?;
        proof.verify(&String::from_utf8_lossy(&server_final))
    }

    #[cfg(feature = "scram")]
    async fn read_auth_payload(&mut self, want_code: i32) -> Result<Vec<u8>> {
        loop {
            let frame = self.read_frame().await?;
            match frame.tag {
                b'R' => {
                    let (code, rest) = parse_auth_request(&frame.payload)?;
                    if code == want_code {
                        return Ok(rest.to_vec());
                    }
                    return Err(ReplicationError::Auth(format!(
                        "unexpected auth code {code}, expected {want_code}"
                    )));
                }
                b'E' => {
                    return Err(ReplicationError::Auth(parse_error_response(&frame.payload)));
                }
                b'S' => self.record_parameter(&frame.payload)?,
                _ => {}
            }
        }
    }

    /// Startup-reported session parameter (`server_version`,
    /// `integer_datetimes`, ...).
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Major version parsed from `server_version` ("16.4" → 16,
    /// "10beta1" → 10).
    pub fn server_version_major(&self) -> Option<u32> {
        let raw = self.parameter("server_version")?;
        let digits: String = raw.chars().take_while(char::is_ascii_digit).collect();
        digits.parse().ok()
    }

    /// True while the connection is inside CopyBoth mode.
    pub fn in_copy(&self) -> bool {
        self.in_copy
    }

    /// Run one simple query and collect its (text-format) result.
    pub async fn simple_query(&mut self, sql: &str) -> Result<QueryResult> {
        debug!(sql, "executing");
        self.send(&framing::query(sql)).await?;

        let mut result = QueryResult::default();
        let mut error = None;
        loop {
            let frame = self.read_frame().await?;
            match frame.tag {
                b'T' => result.columns = parse_row_description(&frame.payload)?,
                b'D' => result.rows.push(parse_data_row(&frame.payload)?),
                b'C' => result.tag = Some(parse_command_complete(&frame.payload)),
                b'I' => result.tag = Some(String::new()), // EmptyQueryResponse
                b'E' => error = Some(parse_error_response(&frame.payload)),
                b'S' => self.record_parameter(&frame.payload)?,
                b'N' => debug!(notice = %parse_error_response(&frame.payload), "server notice"),
                b'Z' => break,
                other => {
                    return Err(ReplicationError::Protocol(format!(
                        "unexpected message {:?} in query response",
                        other as char
                    )));
                }
            }
        }
        match error {
            Some(e) => Err(ReplicationError::Server(format!(
                "{e} (while executing {sql})"
            ))),
            None => Ok(result),
        }
    }

    /// `SHOW <guc>` and return the single value.
    pub async fn show(&mut self, name: &str) -> Result<String> {
        let sql = format!("SHOW {}", quote_identifier(name));
        let result = self.simple_query(&sql).await?;
        result
            .first_value()
            .map(str::to_string)
            .ok_or_else(|| ReplicationError::Protocol(format!("no value returned by {sql}")))
    }

    /// Issue a START_REPLICATION command and require the CopyBoth
    /// transition.
    pub async fn start_replication(&mut self, command: &str) -> Result<()> {
        self.send(&framing::query(command)).await?;
        loop {
            let frame = self.read_frame().await?;
            match frame.tag {
                b'W' => {
                    debug!("entered CopyBoth mode");
                    self.in_copy = true;
                    return Ok(());
                }
                b'E' => {
                    let msg = parse_error_response(&frame.payload);
                    // the error is followed by ReadyForQuery; eat it so a
                    // later Terminate goes out on a clean boundary
                    let _ = self.drain_until_ready().await;
                    return Err(ReplicationError::Server(format!(
                        "{msg} (while executing {command})"
                    )));
                }
                b'S' => self.record_parameter(&frame.payload)?,
                b'N' => debug!(notice = %parse_error_response(&frame.payload), "server notice"),
                b'Z' | b'T' | b'D' | b'C' => {
                    return Err(ReplicationError::Protocol(format!(
                        "server did not enter CopyBoth mode (got {:?}) for {command}",
                        frame.tag as char
                    )));
                }
                _ => {}
            }
        }
    }

    /// Wait up to `wait` for the next CopyData payload.
    ///
    /// Interleaved ParameterStatus/NoticeResponse frames are absorbed. A
    /// server-side CopyDone runs the end-of-stream drain and reports
    /// [`Incoming::Closed`].
    pub async fn recv_replication_frame(&mut self, wait: Duration) -> Result<Incoming> {
        let deadline = Instant::now() + wait;
        loop {
            while let Some(frame) = decode_frame(&mut self.rx)? {
                match frame.tag {
                    b'd' => return Ok(Incoming::Data(frame.payload)),
                    b'c' => return self.finish_stream().await,
                    b'E' => {
                        self.in_copy = false;
                        return Err(ReplicationError::Server(parse_error_response(
                            &frame.payload,
                        )));
                    }
                    b'S' => self.record_parameter(&frame.payload)?,
                    b'N' => debug!(notice = %parse_error_response(&frame.payload), "server notice"),
                    b'C' => {
                        self.in_copy = false;
                        let tag = parse_command_complete(&frame.payload);
                        let _ = self.drain_until_ready().await;
                        return Ok(Incoming::Closed { tag: Some(tag) });
                    }
                    b'Z' => {
                        self.in_copy = false;
                        return Ok(Incoming::Closed { tag: None });
                    }
                    other => {
                        return Err(ReplicationError::Protocol(format!(
                            "unexpected message {:?} during replication",
                            other as char
                        )));
                    }
                }
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(Incoming::Idle);
            };
            match timeout(remaining, self.stream.read_buf(&mut self.rx)).await {
                Err(_elapsed) => return Ok(Incoming::Idle),
                Ok(Ok(0)) => {
                    return Err(ReplicationError::Io(
                        "connection closed by server during replication".into(),
                    ));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Server sent CopyDone: acknowledge it and drain the terminal result.
    /// Per protocol that must be CommandComplete (or an error); a spurious
    /// "no COPY in progress" error here is ignored.
    async fn finish_stream(&mut self) -> Result<Incoming> {
        debug!("server ended the copy stream");
        self.in_copy = false;
        self.send(&framing::copy_done()).await?;

        let mut tag = None;
        loop {
            let frame = self.read_frame().await?;
            match frame.tag {
                b'C' => tag = Some(parse_command_complete(&frame.payload)),
                b'E' => {
                    let msg = parse_error_response(&frame.payload);
                    if msg.contains("no COPY in progress") {
                        debug!("ignoring spurious copy-state error: {msg}");
                        continue;
                    }
                    return Err(ReplicationError::Server(msg));
                }
                b'Z' => return Ok(Incoming::Closed { tag }),
                b'S' => self.record_parameter(&frame.payload)?,
                b'N' => debug!(notice = %parse_error_response(&frame.payload), "server notice"),
                b'd' | b'c' => {} // stragglers already in flight
                _ => {}
            }
        }
    }

    /// Send one CopyData frame (flushes).
    pub async fn send_copy_data(&mut self, payload: &[u8]) -> Result<()> {
        self.send(&framing::copy_data(payload)).await
    }

    /// Terminate and shut the transport down. Idempotent; errors are
    /// swallowed, the session is over either way.
    pub async fn close(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        if let Err(e) = self.send(&framing::terminate()).await {
            debug!("error sending Terminate: {e}");
        }
        if let Err(e) = self.stream.shutdown().await {
            debug!("error shutting down transport: {e}");
        }
    }

    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.stream.write_all(frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<framing::BackendFrame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.rx)? {
                return Ok(frame);
            }
            let n = self.stream.read_buf(&mut self.rx).await?;
            if n == 0 {
                return Err(ReplicationError::Io("connection closed by server".into()));
            }
        }
    }

    async fn drain_until_ready(&mut self) -> Result<()> {
        loop {
            let frame = self.read_frame().await?;
            match frame.tag {
                b'Z' => return Ok(()),
                b'S' => self.record_parameter(&frame.payload)?,
                _ => {}
            }
        }
    }

    fn record_parameter(&mut self, payload: &[u8]) -> Result<()> {
        let (name, value) = parse_parameter_status(payload)?;
        debug!(%name, %value, "parameter status");
        if self.parameters.insert(name.clone(), value).is_some() {
            warn!(%name, "server changed a session parameter mid-stream");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use tokio::io::AsyncWriteExt;

    fn test_config() -> ReplicatorConfig {
        ReplicatorConfig::from_conninfo("host=test user=alice password=pw dbname=app slot=s1")
            .unwrap()
    }

    #[tokio::test]
    async fn handshake_collects_parameters() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let script = tokio::spawn(async move {
            accept_startup(&mut server).await;
            server
        });
        let driver = PgDriver::handshake(Box::new(client), &test_config())
            .await
            .unwrap();
        assert_eq!(driver.parameter("integer_datetimes"), Some("on"));
        assert_eq!(driver.server_version_major(), Some(16));
        script.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_answers_cleartext_password() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let script = tokio::spawn(async move {
            read_startup(&mut server).await;
            server
                .write_all(&msg(b'R', &3i32.to_be_bytes()))
                .await
                .unwrap();
            let (tag, body) = expect_frontend(&mut server).await;
            assert_eq!(tag, b'p');
            assert_eq!(body, b"pw\0");
            let mut out = msg(b'R', &0i32.to_be_bytes());
            out.extend_from_slice(&param_status("server_version", "16.4"));
            out.extend_from_slice(&msg(b'Z', b"I"));
            server.write_all(&out).await.unwrap();
        });
        PgDriver::handshake(Box::new(client), &test_config())
            .await
            .unwrap();
        script.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_surfaces_server_refusal() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            read_startup(&mut server).await;
            server
                .write_all(&error_response("replication connections are disabled"))
                .await
                .unwrap();
        });
        let err = PgDriver::handshake(Box::new(client), &test_config())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Connection(_)), "{err}");
        assert!(err.to_string().contains("disabled"));
    }

    #[tokio::test]
    async fn simple_query_collects_rows() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let script = tokio::spawn(async move {
            accept_startup(&mut server).await;
            let sql = expect_query(&mut server).await;
            assert_eq!(sql, "IDENTIFY_SYSTEM");
            send_query_result(
                &mut server,
                &["systemid", "timeline", "xlogpos", "dbname"],
                &[&[Some("7215"), Some("1"), Some("0/16B6C50"), Some("app")]],
            )
            .await;
        });

        let mut driver = PgDriver::handshake(Box::new(client), &test_config())
            .await
            .unwrap();
        let result = driver.simple_query("IDENTIFY_SYSTEM").await.unwrap();
        assert!(result.is_tuples());
        assert_eq!(result.value("systemid"), Some("7215"));
        assert_eq!(result.value("timeline"), Some("1"));
        assert_eq!(result.value("dbname"), Some("app"));
        script.await.unwrap();
    }

    #[tokio::test]
    async fn query_error_includes_command() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            accept_startup(&mut server).await;
            expect_query(&mut server).await;
            let mut out = error_response("syntax error");
            out.extend_from_slice(&msg(b'Z', b"I"));
            server.write_all(&out).await.unwrap();
        });

        let mut driver = PgDriver::handshake(Box::new(client), &test_config())
            .await
            .unwrap();
        let err = driver.simple_query("BOGUS").await.unwrap_err();
        assert!(err.is_server());
        assert!(err.to_string().contains("BOGUS"), "{err}");
    }

    #[tokio::test]
    async fn start_replication_requires_copy_both() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            accept_startup(&mut server).await;
            expect_query(&mut server).await;
            // tuples result instead of CopyBothResponse
            let mut out = msg(b'C', &cstr("SELECT 0"));
            out.extend_from_slice(&msg(b'Z', b"I"));
            server.write_all(&out).await.unwrap();
        });

        let mut driver = PgDriver::handshake(Box::new(client), &test_config())
            .await
            .unwrap();
        let err = driver
            .start_replication("START_REPLICATION SLOT s1 LOGICAL 0/0")
            .await
            .unwrap_err();
        assert!(
            err.to_string().contains("START_REPLICATION SLOT s1"),
            "{err}"
        );
        assert!(!driver.in_copy());
    }

    #[tokio::test]
    async fn recv_times_out_to_idle() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let script = tokio::spawn(async move {
            accept_startup(&mut server).await;
            enter_copy_both(&mut server).await;
            server // hold the connection open
        });

        let mut driver = PgDriver::handshake(Box::new(client), &test_config())
            .await
            .unwrap();
        driver
            .start_replication("START_REPLICATION SLOT s1 LOGICAL 0/0")
            .await
            .unwrap();
        let got = driver
            .recv_replication_frame(Duration::from_millis(20))
            .await
            .unwrap();
        assert!(matches!(got, Incoming::Idle));
        script.await.unwrap();
    }

    #[tokio::test]
    async fn server_copy_done_drains_terminal_result() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let script = tokio::spawn(async move {
            accept_startup(&mut server).await;
            enter_copy_both(&mut server).await;
            finish_copy(&mut server).await;
        });

        let mut driver = PgDriver::handshake(Box::new(client), &test_config())
            .await
            .unwrap();
        driver
            .start_replication("START_REPLICATION SLOT s1 LOGICAL 0/0")
            .await
            .unwrap();
        let got = driver
            .recv_replication_frame(Duration::from_secs(5))
            .await
            .unwrap();
        match got {
            Incoming::Closed { tag } => assert_eq!(tag.as_deref(), Some("COPY 0")),
            other => panic!("expected Closed, got {other:?}"),
        }
        assert!(!driver.in_copy());
        script.await.unwrap();
    }
}
