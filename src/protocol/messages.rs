//! Backend message payload parsers.
//!
//! Everything a replication session needs out of the query sub-protocol:
//! error/notice fields, authentication requests, row descriptions and data
//! rows (text format), command tags, parameter status, ready-for-query.

use bytes::Buf;

use crate::error::{ReplicationError, Result};

/// Fields of an ErrorResponse / NoticeResponse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    pub severity: Option<String>,
    pub sqlstate: Option<String>,
    pub message: Option<String>,
}

impl ErrorFields {
    /// Parse the `(code_byte, cstring)*` field list.
    pub fn parse(payload: &[u8]) -> ErrorFields {
        let mut fields = ErrorFields::default();
        let mut b = payload;
        while !b.is_empty() {
            let code = b[0];
            b = &b[1..];
            if code == 0 {
                break;
            }
            let Some(pos) = b.iter().position(|&x| x == 0) else {
                break;
            };
            let s = String::from_utf8_lossy(&b[..pos]).to_string();
            match code {
                b'S' => fields.severity = Some(s),
                b'C' => fields.sqlstate = Some(s),
                b'M' => fields.message = Some(s),
                _ => {}
            }
            b = &b[pos + 1..];
        }
        fields
    }

    /// One-line rendering, message first, SQLSTATE appended when present.
    pub fn summary(&self) -> String {
        match (&self.message, &self.sqlstate) {
            (Some(m), Some(c)) => format!("{m} (SQLSTATE {c})"),
            (Some(m), None) => m.clone(),
            _ => "unknown server error".to_string(),
        }
    }
}

pub fn parse_error_response(payload: &[u8]) -> String {
    ErrorFields::parse(payload).summary()
}

pub fn parse_auth_request(payload: &[u8]) -> Result<(i32, &[u8])> {
    if payload.len() < 4 {
        return Err(ReplicationError::Protocol("auth request too short".into()));
    }
    let mut b = payload;
    let code = b.get_i32();
    Ok((code, b))
}

/// RowDescription: column names (type metadata is skipped; replication
/// commands answer in text format).
pub fn parse_row_description(payload: &[u8]) -> Result<Vec<String>> {
    let mut b = payload;
    if b.len() < 2 {
        return Err(ReplicationError::Protocol(
            "row description too short".into(),
        ));
    }
    let nfields = b.get_i16();
    if nfields < 0 {
        return Err(ReplicationError::Protocol(format!(
            "negative field count: {nfields}"
        )));
    }
    let mut columns = Vec::with_capacity(nfields as usize);
    for _ in 0..nfields {
        columns.push(read_cstring(&mut b)?);
        // table oid (4) + attnum (2) + type oid (4) + typlen (2) +
        // atttypmod (4) + format (2)
        if b.len() < 18 {
            return Err(ReplicationError::Protocol(
                "row description truncated".into(),
            ));
        }
        b.advance(18);
    }
    Ok(columns)
}

/// DataRow in text format: `None` for SQL NULL.
pub fn parse_data_row(payload: &[u8]) -> Result<Vec<Option<String>>> {
    let mut b = payload;
    if b.len() < 2 {
        return Err(ReplicationError::Protocol("data row too short".into()));
    }
    let ncols = b.get_i16();
    if ncols < 0 {
        return Err(ReplicationError::Protocol(format!(
            "negative column count: {ncols}"
        )));
    }
    let mut values = Vec::with_capacity(ncols as usize);
    for _ in 0..ncols {
        if b.len() < 4 {
            return Err(ReplicationError::Protocol("data row truncated".into()));
        }
        let len = b.get_i32();
        if len < 0 {
            values.push(None);
            continue;
        }
        let len = len as usize;
        if b.len() < len {
            return Err(ReplicationError::Protocol("data row truncated".into()));
        }
        values.push(Some(String::from_utf8_lossy(&b[..len]).to_string()));
        b.advance(len);
    }
    Ok(values)
}

/// CommandComplete tag, e.g. `"SELECT 1"` or `"COPY 0"`.
pub fn parse_command_complete(payload: &[u8]) -> String {
    let end = payload
        .iter()
        .position(|&x| x == 0)
        .unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).to_string()
}

/// ParameterStatus: `(name, value)`.
pub fn parse_parameter_status(payload: &[u8]) -> Result<(String, String)> {
    let mut b = payload;
    let name = read_cstring(&mut b)?;
    let value = read_cstring(&mut b)?;
    Ok((name, value))
}

/// BackendKeyData: `(pid, secret)`.
pub fn parse_backend_key_data(payload: &[u8]) -> Result<(i32, i32)> {
    if payload.len() < 8 {
        return Err(ReplicationError::Protocol(
            "backend key data too short".into(),
        ));
    }
    let mut b = payload;
    Ok((b.get_i32(), b.get_i32()))
}

/// ReadyForQuery transaction status byte: `I`, `T` or `E`.
pub fn ready_for_query_status(payload: &[u8]) -> Result<u8> {
    payload
        .first()
        .copied()
        .ok_or_else(|| ReplicationError::Protocol("empty ReadyForQuery".into()))
}

fn read_cstring(b: &mut &[u8]) -> Result<String> {
    let pos = b
        .iter()
        .position(|&x| x == 0)
        .ok_or_else(|| ReplicationError::Protocol("unterminated string".into()))?;
    let s = String::from_utf8_lossy(&b[..pos]).to_string();
    *b = &b[pos + 1..];
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cstr(s: &str) -> Vec<u8> {
        let mut v = s.as_bytes().to_vec();
        v.push(0);
        v
    }

    #[test]
    fn error_fields_prefer_message() {
        let mut payload = Vec::new();
        payload.push(b'M');
        payload.extend_from_slice(&cstr("hello"));
        payload.push(b'C');
        payload.extend_from_slice(&cstr("42P01"));
        payload.push(0);
        let s = parse_error_response(&payload);
        assert!(s.contains("hello"));
        assert!(s.contains("SQLSTATE 42P01"));
    }

    #[test]
    fn error_fields_capture_severity() {
        let mut payload = Vec::new();
        payload.push(b'S');
        payload.extend_from_slice(&cstr("FATAL"));
        payload.push(b'M');
        payload.extend_from_slice(&cstr("nope"));
        payload.push(0);
        let fields = ErrorFields::parse(&payload);
        assert_eq!(fields.severity.as_deref(), Some("FATAL"));
        assert_eq!(fields.message.as_deref(), Some("nope"));
    }

    #[test]
    fn row_description_extracts_names() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&3i16.to_be_bytes());
        for name in ["systemid", "timeline", "dbname"] {
            payload.extend_from_slice(&cstr(name));
            payload.extend_from_slice(&[0u8; 18]);
        }
        let cols = parse_row_description(&payload).unwrap();
        assert_eq!(cols, vec!["systemid", "timeline", "dbname"]);
    }

    #[test]
    fn data_row_handles_nulls() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&3i16.to_be_bytes());
        payload.extend_from_slice(&4i32.to_be_bytes());
        payload.extend_from_slice(b"7215");
        payload.extend_from_slice(&(-1i32).to_be_bytes());
        payload.extend_from_slice(&1i32.to_be_bytes());
        payload.extend_from_slice(b"1");
        let row = parse_data_row(&payload).unwrap();
        assert_eq!(
            row,
            vec![Some("7215".to_string()), None, Some("1".to_string())]
        );
    }

    #[test]
    fn data_row_rejects_truncation() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1i16.to_be_bytes());
        payload.extend_from_slice(&100i32.to_be_bytes());
        payload.extend_from_slice(b"short");
        assert!(parse_data_row(&payload).is_err());
    }

    #[test]
    fn parameter_status_round_trip() {
        let mut payload = cstr("integer_datetimes");
        payload.extend_from_slice(&cstr("on"));
        let (name, value) = parse_parameter_status(&payload).unwrap();
        assert_eq!(name, "integer_datetimes");
        assert_eq!(value, "on");
    }

    #[test]
    fn command_complete_tag() {
        assert_eq!(parse_command_complete(&cstr("SELECT 1")), "SELECT 1");
    }
}
