//! Line envelope shared by raw and rollup logs.
//!
//! Each line is a JSON object carrying an integer epoch-second `timestamp`,
//! optionally prefixed with a human-readable write time:
//!
//! ```text
//! [2026-03-14 09:26:53] {"timestamp":1773480413,"latency":12.4,"host":"gw"}
//! ```
//!
//! The bracketed prefix is cosmetic. The embedded `timestamp` is the only
//! authoritative time, and readers accept bare JSON lines as well.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A timestamped JSON object stored as one log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Epoch seconds. For rollup records, the start of the bucket.
    pub timestamp: i64,

    /// All remaining metric fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// A raw sample as written by a collector.
pub type Sample = Record;

/// An aggregated record written by the rollup processor.
pub type RollupRecord = Record;

impl Record {
    /// Creates a record with no fields.
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            fields: Map::new(),
        }
    }

    /// Adds a field, builder style.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Sets a field, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Returns a field value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns a field as a number, if it is one.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(Value::as_f64)
    }

    /// Returns a field as a string, if it is one.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

/// Serializes a record into a complete log line, including the newline.
///
/// The bracketed prefix is the record's own timestamp in local time, so the
/// same record always formats to the same line. A timestamp chrono cannot
/// represent is written as a bare JSON line.
///
/// # Errors
///
/// Returns an error if a field value cannot be represented as JSON.
pub fn format_line(record: &Record) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(record)?;
    let line = match chrono::DateTime::from_timestamp(record.timestamp, 0) {
        Some(utc) => {
            let local = utc.with_timezone(&chrono::Local);
            format!("[{}] {json}\n", local.format("%Y-%m-%d %H:%M:%S"))
        }
        None => format!("{json}\n"),
    };
    Ok(line)
}

/// Parses one log line in either the bracketed or the bare JSON format.
///
/// Returns `None` for blank lines, malformed JSON, and objects without an
/// integer `timestamp`.
pub fn parse_line(line: &str) -> Option<Record> {
    let json = json_payload(line)?;
    serde_json::from_str(json).ok()
}

/// Returns the JSON part of a line, stripping the bracketed prefix if any.
fn json_payload(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.starts_with('{') {
        return Some(line);
    }
    let rest = line.strip_prefix('[')?;
    let (_, payload) = rest.split_once(']')?;
    let payload = payload.trim_start();
    payload.starts_with('{').then_some(payload)
}

/// Finds the `"timestamp": <integer>` value in a line without parsing JSON.
///
/// Used to skip cold lines cheaply. A line where this returns `Some` may
/// still fail [`parse_line`].
pub fn extract_timestamp(line: &str) -> Option<i64> {
    const KEY: &str = "\"timestamp\"";

    let after_key = &line[line.find(KEY)? + KEY.len()..];
    let value = after_key.trim_start().strip_prefix(':')?.trim_start();

    let (negative, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }

    let magnitude: i64 = digits[..end].parse().ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_line_envelope() {
        let record = Record::new(1000).with("latency", 12.5);
        let line = format_line(&record).unwrap();

        let prefix = chrono::DateTime::from_timestamp(1000, 0)
            .unwrap()
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        assert_eq!(
            line,
            format!("[{prefix}] {{\"timestamp\":1000,\"latency\":12.5}}\n")
        );
        assert_eq!(format_line(&record).unwrap(), line);
    }

    #[test]
    fn test_format_line_unrepresentable_timestamp_is_bare() {
        let record = Record::new(i64::MAX);
        let line = format_line(&record).unwrap();
        assert_eq!(line, format!("{{\"timestamp\":{}}}\n", i64::MAX));
        assert_eq!(parse_line(&line).unwrap().timestamp, i64::MAX);
    }

    #[test]
    fn test_parse_both_formats() {
        let bracketed = r#"[2026-01-01 00:00:00] {"timestamp":1000,"latency":10}"#;
        let bare = r#"{"timestamp":1000,"latency":10}"#;

        let a = parse_line(bracketed).unwrap();
        let b = parse_line(bare).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.timestamp, 1000);
        assert_eq!(a.get_f64("latency"), Some(10.0));
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        assert!(parse_line("").is_none());
        assert!(parse_line("   ").is_none());
        assert!(parse_line("[2026-01-01 00:00:00] not json").is_none());
        assert!(parse_line(r#"{"latency":10}"#).is_none());
        assert!(parse_line(r#"{"timestamp":"1000"}"#).is_none());
        assert!(parse_line(r#"{"timestamp":1000"#).is_none());
    }

    #[test]
    fn test_fields_round_trip_through_line() {
        let record = Record::new(42)
            .with("host", "gw")
            .with("nested", json!({"a": [1, 2]}));
        let parsed = parse_line(&format_line(&record).unwrap()).unwrap();

        assert_eq!(parsed, record);
        assert_eq!(parsed.get_str("host"), Some("gw"));
    }

    #[test]
    fn test_extract_timestamp() {
        assert_eq!(
            extract_timestamp(r#"[x] {"timestamp":1700000000,"v":1}"#),
            Some(1_700_000_000)
        );
        assert_eq!(extract_timestamp(r#"{"timestamp" : 15}"#), Some(15));
        assert_eq!(extract_timestamp(r#"{"timestamp":-5}"#), Some(-5));
        assert_eq!(extract_timestamp(r#"{"last_timestamp":5}"#), None);
        assert_eq!(extract_timestamp(r#"{"timestamp":null}"#), None);
        assert_eq!(extract_timestamp("garbage"), None);
    }
}
