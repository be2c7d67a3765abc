//! Text encodings of scalar values.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{NaiveDateTime, TimeZone, Utc};
use uuid::Uuid;

use passvault_common::{Error, Result};
use passvault_model::Timestamp;

/// Seconds between 0001-01-01T00:00:00Z and the Unix epoch.
const SECONDS_TO_UNIX_EPOCH: i64 = 62_135_596_800;

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

fn malformed(msg: impl Into<String>) -> Error {
    Error::MalformedPayload(msg.into())
}

/// 0001-01-01T00:00:00Z, used for timestamps a document leaves out.
pub fn zero_time() -> Timestamp {
    Utc.timestamp_opt(-SECONDS_TO_UNIX_EPOCH, 0)
        .single()
        .unwrap_or_default()
}

pub fn format_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

pub fn parse_bool(text: &str) -> Result<bool> {
    match text.trim() {
        t if t.eq_ignore_ascii_case("true") || t == "1" => Ok(true),
        t if t.eq_ignore_ascii_case("false") || t == "0" => Ok(false),
        other => Err(malformed(format!("Invalid boolean '{}'", other))),
    }
}

pub fn format_tristate(value: Option<bool>) -> &'static str {
    match value {
        None => "null",
        Some(v) => format_bool(v),
    }
}

pub fn parse_tristate(text: &str) -> Result<Option<bool>> {
    let t = text.trim();
    if t.is_empty() || t.eq_ignore_ascii_case("null") {
        Ok(None)
    } else {
        parse_bool(t).map(Some)
    }
}

pub fn format_uuid(uuid: &Uuid) -> String {
    STANDARD.encode(uuid.as_bytes())
}

/// Decode a base64 uuid. Empty text is the nil uuid.
pub fn parse_uuid(text: &str) -> Result<Uuid> {
    let t = text.trim();
    if t.is_empty() {
        return Ok(Uuid::nil());
    }
    let bytes = STANDARD
        .decode(t)
        .map_err(|_| malformed(format!("Invalid uuid '{}'", t)))?;
    Uuid::from_slice(&bytes).map_err(|_| malformed(format!("Invalid uuid '{}'", t)))
}

pub fn format_base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn parse_base64(text: &str) -> Result<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|_| malformed("Invalid base64 data"))
}

/// ISO-8601 form used by 3.x documents.
pub fn format_time_iso(ts: &Timestamp) -> String {
    ts.format(ISO_FORMAT).to_string()
}

/// Binary form used by 4.x documents: base64 of seconds since year 1.
pub fn format_time_binary(ts: &Timestamp) -> String {
    let seconds = ts.timestamp() + SECONDS_TO_UNIX_EPOCH;
    STANDARD.encode(seconds.to_le_bytes())
}

/// Parse either time encoding.
pub fn parse_time(text: &str) -> Result<Timestamp> {
    let t = text.trim();
    let invalid = || malformed(format!("Invalid timestamp '{}'", t));

    if t.contains('-') && t.contains(':') {
        if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(t) {
            return Ok(passvault_model::times::truncate(parsed.with_timezone(&Utc)));
        }
        let naive =
            NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S").map_err(|_| invalid())?;
        return Ok(Utc.from_utc_datetime(&naive));
    }

    let bytes = STANDARD.decode(t).map_err(|_| invalid())?;
    let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| invalid())?;
    let seconds = i64::from_le_bytes(raw)
        .checked_sub(SECONDS_TO_UNIX_EPOCH)
        .ok_or_else(invalid)?;
    Utc.timestamp_opt(seconds, 0).single().ok_or_else(invalid)
}

pub fn parse_number<T: std::str::FromStr>(text: &str, what: &str) -> Result<T> {
    text.trim()
        .parse()
        .map_err(|_| malformed(format!("Invalid {} '{}'", what, text.trim())))
}
