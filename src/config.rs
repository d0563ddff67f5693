//! Replication session configuration.
//!
//! [`ReplicatorConfig`] normalizes caller-supplied options into a validated,
//! immutable configuration. Input comes in two shapes:
//!
//! - a libpq-style connection string (`"host=10.0.0.5 dbname=app slot=events"`),
//!   parsed with the usual quoting rules, or
//! - a mapping of named options ([`ReplicatorConfig::from_options`]).
//!
//! Replication-specific keys (`slot`, `start_position`/`startpos`,
//! `end_position`/`endpos`, `timeline`, `systemid`, `status_interval`,
//! `plugin_options`) are extracted here and never reach the server as
//! connection parameters. `replication=database` is always enforced.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ReplicationError, Result};
use crate::lsn::Lsn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SslMode {
    Disable,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub mode: SslMode,
    pub ca_pem_path: Option<PathBuf>,
    pub sni_hostname: Option<String>,
}

impl TlsConfig {
    pub fn disabled() -> Self {
        TlsConfig {
            mode: SslMode::Disable,
            ca_pem_path: None,
            sni_hostname: None,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig::disabled()
    }
}

/// A single caller-supplied option value.
///
/// Mirrors the loose typing of configuration sources (environment, TOML,
/// JSON): everything the parser accepts is one of these. `Map` is only
/// meaningful for `plugin_options`.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Map(BTreeMap<String, OptionValue>),
    Null,
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Text(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Text(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int(v)
    }
}

impl From<u64> for OptionValue {
    fn from(v: u64) -> Self {
        OptionValue::Text(v.to_string())
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        OptionValue::Float(v)
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<BTreeMap<String, OptionValue>> for OptionValue {
    fn from(v: BTreeMap<String, OptionValue>) -> Self {
        OptionValue::Map(v)
    }
}

/// Validated configuration for one replication session.
///
/// Immutable after construction; [`crate::Replicator`] echoes these values
/// through its accessors.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    host: String,
    port: u16,
    user: String,
    password: String,
    dbname: Option<String>,
    application_name: String,
    /// Connection-string keys we neither interpret nor send (echoed by
    /// [`ReplicatorConfig::conninfo`]).
    extra_params: BTreeMap<String, String>,

    tls: TlsConfig,

    slot: String,
    start_position: Lsn,
    end_position: Lsn,
    timeline: Option<u32>,
    systemid: Option<String>,
    /// `None` means "adopt the server's wal_receiver_status_interval".
    status_interval: Option<Duration>,
    /// Output-plugin options, rendered to strings, in input order.
    plugin_options: Vec<(String, String)>,
}

impl ReplicatorConfig {
    /// Parse a libpq-style connection string.
    ///
    /// Replication-specific keys may be mixed into the string and are
    /// extracted; the remainder forms the connection parameters.
    pub fn from_conninfo(conninfo: &str) -> Result<Self> {
        let pairs = parse_conninfo(conninfo)?
            .into_iter()
            .map(|(k, v)| (k, OptionValue::Text(v)));
        Self::build(pairs)
    }

    /// Build from a mapping of named options.
    ///
    /// ```
    /// use pglogstream::{OptionValue, ReplicatorConfig};
    ///
    /// let cfg = ReplicatorConfig::from_options([
    ///     ("host", OptionValue::from("10.0.0.5")),
    ///     ("dbname", OptionValue::from("app")),
    ///     ("slot", OptionValue::from("events")),
    ///     ("startpos", OptionValue::from("0/16B6C50")),
    /// ]).unwrap();
    /// assert_eq!(cfg.slot(), "events");
    /// ```
    pub fn from_options<I, K>(options: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, OptionValue)>,
        K: Into<String>,
    {
        Self::build(options.into_iter().map(|(k, v)| (k.into(), v)))
    }

    fn build<I>(options: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, OptionValue)>,
    {
        let mut params: BTreeMap<String, String> = BTreeMap::new();
        let mut slot = None;
        let mut start_position = Lsn::ZERO;
        let mut end_position = Lsn::ZERO;
        let mut timeline = None;
        let mut systemid = None;
        let mut status_interval = None;
        let mut plugin_options = Vec::new();

        for (key, value) in options {
            match key.as_str() {
                "slot" => slot = reserved_text(&key, value)?,
                "start_position" | "startpos" => start_position = lsn_value(&key, value)?,
                "end_position" | "endpos" => end_position = lsn_value(&key, value)?,
                "timeline" => timeline = timeline_value(value)?,
                "systemid" => systemid = reserved_text(&key, value)?,
                "status_interval" => status_interval = interval_value(value)?,
                "plugin_options" => plugin_options = plugin_option_pairs(value)?,
                // In map form, `options` carrying a map is the plugin-option
                // alias; as a string it stays a plain libpq parameter.
                "options" if matches!(value, OptionValue::Map(_)) => {
                    plugin_options = plugin_option_pairs(value)?
                }
                _ => {
                    // Empty-string and null values are dropped before the
                    // driver sees them.
                    if let Some(text) = param_text(&key, value)?
                        && !text.is_empty()
                    {
                        params.insert(key, text);
                    }
                }
            }
        }

        let slot = slot.ok_or_else(|| {
            ReplicationError::Config("a replication slot name is required".into())
        })?;

        if params
            .insert("replication".into(), "database".into())
            .is_some_and(|prev| prev != "database")
        {
            tracing::debug!("overriding replication parameter to \"database\"");
        }

        let host = take_or_env(&mut params, "host", "PGHOST").unwrap_or_else(|| "127.0.0.1".into());
        let port = match take_or_env(&mut params, "port", "PGPORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| ReplicationError::Config(format!("invalid port: {raw}")))?,
            None => 5432,
        };
        let user = take_or_env(&mut params, "user", "PGUSER").unwrap_or_else(|| "postgres".into());
        let password = take_or_env(&mut params, "password", "PGPASSWORD").unwrap_or_default();
        let dbname = params
            .remove("dbname")
            .or_else(|| params.remove("database"))
            .or_else(|| std::env::var("PGDATABASE").ok().filter(|v| !v.is_empty()));
        let application_name = params
            .remove("application_name")
            .unwrap_or_else(|| "pglogstream".into());

        let tls = tls_from_params(&mut params)?;
        params.remove("replication");

        Ok(ReplicatorConfig {
            host,
            port,
            user,
            password,
            dbname,
            application_name,
            extra_params: params,
            tls,
            slot,
            start_position,
            end_position,
            timeline,
            systemid,
            status_interval,
            plugin_options,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }

    pub fn dbname(&self) -> Option<&str> {
        self.dbname.as_deref()
    }

    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    pub fn tls(&self) -> &TlsConfig {
        &self.tls
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn start_position(&self) -> Lsn {
        self.start_position
    }

    pub fn end_position(&self) -> Lsn {
        self.end_position
    }

    pub fn timeline(&self) -> Option<u32> {
        self.timeline
    }

    pub fn systemid(&self) -> Option<&str> {
        self.systemid.as_deref()
    }

    pub fn status_interval(&self) -> Option<Duration> {
        self.status_interval
    }

    pub fn plugin_options(&self) -> &[(String, String)] {
        &self.plugin_options
    }

    /// Render the connection parameters as a libpq-style string.
    ///
    /// The password is omitted, matching how libpq echoes conninfo.
    pub fn conninfo(&self) -> String {
        let mut parts = vec![
            format!("host={}", quote_conninfo_value(&self.host)),
            format!("port={}", self.port),
            format!("user={}", quote_conninfo_value(&self.user)),
        ];
        if let Some(db) = &self.dbname {
            parts.push(format!("dbname={}", quote_conninfo_value(db)));
        }
        parts.push("replication=database".into());
        parts.push(format!(
            "application_name={}",
            quote_conninfo_value(&self.application_name)
        ));
        for (k, v) in &self.extra_params {
            parts.push(format!("{k}={}", quote_conninfo_value(v)));
        }
        parts.join(" ")
    }
}

fn take_or_env(
    params: &mut BTreeMap<String, String>,
    key: &str,
    env_key: &str,
) -> Option<String> {
    params
        .remove(key)
        .or_else(|| std::env::var(env_key).ok().filter(|v| !v.is_empty()))
}

fn reserved_text(key: &str, value: OptionValue) -> Result<Option<String>> {
    Ok(param_text(key, value)?.filter(|text| !text.is_empty()))
}

/// Stringify a top-level option value; `None` means "drop this key".
fn param_text(key: &str, value: OptionValue) -> Result<Option<String>> {
    match value {
        OptionValue::Text(s) => Ok(Some(s)),
        OptionValue::Int(n) => Ok(Some(n.to_string())),
        OptionValue::Float(f) => Ok(Some(f.to_string())),
        OptionValue::Bool(b) => Ok(Some(b.to_string())),
        OptionValue::Null => Ok(None),
        OptionValue::Map(_) => Err(ReplicationError::Config(format!(
            "option {key} does not accept a map value"
        ))),
    }
}

fn lsn_value(key: &str, value: OptionValue) -> Result<Lsn> {
    match value {
        OptionValue::Text(s) => {
            Lsn::parse(&s).map_err(|e| ReplicationError::Config(format!("{key}: {e}")))
        }
        OptionValue::Int(n) if n >= 0 => Ok(Lsn(n as u64)),
        OptionValue::Null => Ok(Lsn::ZERO),
        other => Err(ReplicationError::Config(format!(
            "{key} must be an LSN string or a non-negative integer, got {other:?}"
        ))),
    }
}

fn timeline_value(value: OptionValue) -> Result<Option<u32>> {
    let n = match value {
        OptionValue::Int(n) => n,
        OptionValue::Text(s) => s
            .parse::<i64>()
            .map_err(|_| ReplicationError::Config(format!("invalid timeline: {s}")))?,
        OptionValue::Null => return Ok(None),
        other => {
            return Err(ReplicationError::Config(format!(
                "timeline must be a positive integer, got {other:?}"
            )));
        }
    };
    if n <= 0 || n > i64::from(u32::MAX) {
        return Err(ReplicationError::Config(format!(
            "timeline must be a positive integer, got {n}"
        )));
    }
    Ok(Some(n as u32))
}

fn interval_value(value: OptionValue) -> Result<Option<Duration>> {
    let secs = match value {
        OptionValue::Int(n) => n as f64,
        OptionValue::Float(f) => f,
        OptionValue::Text(s) => s
            .parse::<f64>()
            .map_err(|_| ReplicationError::Config(format!("invalid status_interval: {s}")))?,
        OptionValue::Null => return Ok(None),
        other => {
            return Err(ReplicationError::Config(format!(
                "status_interval must be a number of seconds, got {other:?}"
            )));
        }
    };
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ReplicationError::Config(format!(
            "status_interval must be positive, got {secs}"
        )));
    }
    Ok(Some(Duration::from_secs_f64(secs)))
}

/// Render plugin options: booleans as `on`/`off`, everything else
/// stringified. Keys keep their input order.
fn plugin_option_pairs(value: OptionValue) -> Result<Vec<(String, String)>> {
    let OptionValue::Map(map) = value else {
        return Err(ReplicationError::Config(
            "plugin_options must be a map of option name to value".into(),
        ));
    };
    let mut pairs = Vec::with_capacity(map.len());
    for (name, value) in map {
        let rendered = match value {
            OptionValue::Bool(true) => "on".to_string(),
            OptionValue::Bool(false) => "off".to_string(),
            OptionValue::Text(s) => s,
            OptionValue::Int(n) => n.to_string(),
            OptionValue::Float(f) => f.to_string(),
            other => {
                return Err(ReplicationError::Config(format!(
                    "plugin option {name} has an unrenderable value: {other:?}"
                )));
            }
        };
        pairs.push((name, rendered));
    }
    Ok(pairs)
}

fn tls_from_params(params: &mut BTreeMap<String, String>) -> Result<TlsConfig> {
    let mode = match params.remove("sslmode").as_deref() {
        None => SslMode::Prefer,
        Some("disable") => SslMode::Disable,
        Some("allow") | Some("prefer") => SslMode::Prefer,
        Some("require") => SslMode::Require,
        Some("verify-ca") => SslMode::VerifyCa,
        Some("verify-full") => SslMode::VerifyFull,
        Some(other) => {
            return Err(ReplicationError::Config(format!(
                "unknown sslmode: {other}"
            )));
        }
    };
    let ca_pem_path = params.remove("sslrootcert").map(PathBuf::from);
    Ok(TlsConfig {
        mode,
        ca_pem_path,
        sni_hostname: None,
    })
}

/// Parse a libpq-style connection string: whitespace-separated `key=value`
/// pairs, values optionally single-quoted with `\'` and `\\` escapes.
fn parse_conninfo(input: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        let mut saw_eq = false;
        while let Some(c) = chars.next() {
            if c == '=' {
                saw_eq = true;
                break;
            }
            if c.is_whitespace() {
                while chars.next_if(|c| c.is_whitespace()).is_some() {}
                saw_eq = chars.next_if_eq(&'=').is_some();
                break;
            }
            key.push(c);
        }
        if key.is_empty() || !saw_eq {
            return Err(ReplicationError::Config(format!(
                "missing \"=\" after \"{key}\" in connection string"
            )));
        }

        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'\'').is_some() {
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some(esc) => value.push(esc),
                        None => break,
                    },
                    '\'' => {
                        closed = true;
                        break;
                    }
                    _ => value.push(c),
                }
            }
            if !closed {
                return Err(ReplicationError::Config(format!(
                    "unterminated quoted value for \"{key}\""
                )));
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                if c == '\\' {
                    if let Some(esc) = chars.next() {
                        value.push(esc);
                    }
                } else {
                    value.push(c);
                }
            }
        }

        pairs.push((key, value));
    }

    Ok(pairs)
}

fn quote_conninfo_value(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| !c.is_whitespace() && c != '\'' && c != '\\')
    {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conninfo_basic() {
        let cfg = ReplicatorConfig::from_conninfo(
            "host=db.internal port=5433 user=replica dbname=app slot=events",
        )
        .unwrap();
        assert_eq!(cfg.host(), "db.internal");
        assert_eq!(cfg.port(), 5433);
        assert_eq!(cfg.user(), "replica");
        assert_eq!(cfg.dbname(), Some("app"));
        assert_eq!(cfg.slot(), "events");
        assert_eq!(cfg.start_position(), Lsn::ZERO);
        assert_eq!(cfg.end_position(), Lsn::ZERO);
        assert!(cfg.conninfo().contains("replication=database"));
        assert!(!cfg.conninfo().contains("slot="));
    }

    #[test]
    fn conninfo_quoted_values() {
        let cfg = ReplicatorConfig::from_conninfo(
            r"host=localhost dbname='my db' password='p\'w' slot=s1",
        )
        .unwrap();
        assert_eq!(cfg.dbname(), Some("my db"));
        assert_eq!(cfg.password(), "p'w");
    }

    #[test]
    fn conninfo_rejects_malformed() {
        assert!(ReplicatorConfig::from_conninfo("host").is_err());
        assert!(ReplicatorConfig::from_conninfo("dbname='oops slot=s1").is_err());
    }

    #[test]
    fn reserved_keys_are_extracted() {
        let cfg = ReplicatorConfig::from_conninfo(
            "host=h dbname=d slot=s1 startpos=0/16B6C50 endpos=3B/6C036B08 timeline=4 systemid=7215 status_interval=2",
        )
        .unwrap();
        assert_eq!(cfg.start_position(), Lsn(0x16B_6C50));
        assert_eq!(cfg.end_position(), Lsn(255_215_233_800));
        assert_eq!(cfg.timeline(), Some(4));
        assert_eq!(cfg.systemid(), Some("7215"));
        assert_eq!(cfg.status_interval(), Some(Duration::from_secs(2)));
        let rendered = cfg.conninfo();
        for reserved in ["startpos", "endpos", "timeline", "systemid", "status_interval"] {
            assert!(!rendered.contains(reserved), "{reserved} leaked: {rendered}");
        }
    }

    #[test]
    fn option_map_with_aliases() {
        let cfg = ReplicatorConfig::from_options([
            ("host", OptionValue::from("h")),
            ("slot", OptionValue::from("s1")),
            ("start_position", OptionValue::from("FFFFFFFF/FFFFFFFF")),
            ("end_position", OptionValue::Int(0)),
        ])
        .unwrap();
        assert_eq!(cfg.start_position(), Lsn(u64::MAX));
        assert_eq!(cfg.end_position(), Lsn::ZERO);
    }

    #[test]
    fn plugin_options_render_booleans() {
        let mut opts = BTreeMap::new();
        opts.insert("include-timestamp".to_string(), OptionValue::Bool(true));
        opts.insert("skip-empty-xacts".to_string(), OptionValue::Bool(false));
        opts.insert("format-version".to_string(), OptionValue::Int(2));
        let cfg = ReplicatorConfig::from_options([
            ("slot", OptionValue::from("s1")),
            ("plugin_options", OptionValue::Map(opts)),
        ])
        .unwrap();
        let rendered: BTreeMap<_, _> = cfg
            .plugin_options()
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(rendered["include-timestamp"], "on");
        assert_eq!(rendered["skip-empty-xacts"], "off");
        assert_eq!(rendered["format-version"], "2");
    }

    #[test]
    fn plugin_option_map_value_is_rejected() {
        let mut inner = BTreeMap::new();
        inner.insert("x".to_string(), OptionValue::Null);
        let mut opts = BTreeMap::new();
        opts.insert("bad".to_string(), OptionValue::Map(inner));
        let err = ReplicatorConfig::from_options([
            ("slot", OptionValue::from("s1")),
            ("plugin_options", OptionValue::Map(opts)),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("bad"));
    }

    #[test]
    fn null_and_empty_params_are_dropped() {
        let cfg = ReplicatorConfig::from_options([
            ("slot", OptionValue::from("s1")),
            ("connect_timeout", OptionValue::Null),
            ("keepalives", OptionValue::from("")),
            ("target_session_attrs", OptionValue::from("any")),
        ])
        .unwrap();
        let rendered = cfg.conninfo();
        assert!(!rendered.contains("connect_timeout"));
        assert!(!rendered.contains("keepalives"));
        assert!(rendered.contains("target_session_attrs=any"));
    }

    #[test]
    fn malformed_lsn_fails_construction() {
        let err = ReplicatorConfig::from_options([
            ("slot", OptionValue::from("s1")),
            ("startpos", OptionValue::from("not-an-lsn")),
        ])
        .unwrap_err();
        assert!(matches!(err, ReplicationError::Config(_)));
    }

    #[test]
    fn missing_slot_fails_construction() {
        let err = ReplicatorConfig::from_conninfo("host=h dbname=d").unwrap_err();
        assert!(err.to_string().contains("slot"));
    }

    #[test]
    fn status_interval_must_be_positive() {
        let err = ReplicatorConfig::from_options([
            ("slot", OptionValue::from("s1")),
            ("status_interval", OptionValue::Int(0)),
        ])
        .unwrap_err();
        assert!(matches!(err, ReplicationError::Config(_)));
    }

    #[test]
    fn sslmode_maps_to_tls_config() {
        let cfg =
            ReplicatorConfig::from_conninfo("slot=s1 sslmode=verify-full sslrootcert=/tmp/ca.pem")
                .unwrap();
        assert_eq!(cfg.tls().mode, SslMode::VerifyFull);
        assert_eq!(
            cfg.tls().ca_pem_path.as_deref(),
            Some(std::path::Path::new("/tmp/ca.pem"))
        );
    }
}
