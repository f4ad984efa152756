//! Record normalization
//!
//! Maps raw CSV rows with inconsistent column naming into the canonical
//! flow/threat shapes. Normalization never fails: missing or malformed
//! values fall back to defaults so a row always yields a record.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::models::{CanonicalRecord, FlowRecord, RecordType, ThreatRecord};

/// A raw CSV row as column name -> string value
pub type RawRow = HashMap<String, String>;

// Known column-name aliases per semantic field, in priority order.
// First alias with a non-empty value wins.
const ID_ALIASES: &[&str] = &["id"];
const TIMESTAMP_ALIASES: &[&str] = &["timestamp", "Timestamp", "Time"];
const SOURCE_IP_ALIASES: &[&str] = &["sourceIP", "SourceIP", "Source Address"];
const SOURCE_PORT_ALIASES: &[&str] = &["sourcePort", "SourcePort", "Source Port"];
const DESTINATION_IP_ALIASES: &[&str] = &["destinationIP", "DestinationIP", "Destination Address"];
const DESTINATION_PORT_ALIASES: &[&str] =
    &["destinationPort", "DestinationPort", "Destination Port"];
const PROTOCOL_ALIASES: &[&str] = &["protocol", "Protocol"];
const APPLICATION_ALIASES: &[&str] = &["application", "Application"];
const CATEGORY_ALIASES: &[&str] = &["category", "Category"];
const BYTES_ALIASES: &[&str] = &["bytes", "Bytes", "Data Transferred"];
const PACKETS_ALIASES: &[&str] = &["packets", "Packets"];
const DURATION_ALIASES: &[&str] = &["duration", "Duration"];
const DIRECTION_ALIASES: &[&str] = &["direction", "Direction"];
const CLIENT_NAME_ALIASES: &[&str] = &["clientName", "Client Name"];
const SESSION_ID_ALIASES: &[&str] = &["sessionId", "Session ID"];
const ACTION_ALIASES: &[&str] = &["action", "Action"];
const THREAT_TYPE_ALIASES: &[&str] = &["threatType", "ThreatType", "Threat Type"];
const THREAT_CATEGORY_ALIASES: &[&str] = &["threatCategory", "ThreatCategory", "Threat Category"];
const SEVERITY_ALIASES: &[&str] = &["severity", "Severity"];

/// Normalize a raw row into the canonical shape for the given record type
pub fn normalize(row: &RawRow, record_type: RecordType) -> CanonicalRecord {
    let raw = serde_json::to_value(row).unwrap_or_default();
    let id = pick(row, ID_ALIASES)
        .map(str::to_string)
        .unwrap_or_else(generate_id);
    let timestamp = parse_timestamp(pick(row, TIMESTAMP_ALIASES));

    match record_type {
        RecordType::Flows => CanonicalRecord::Flow(FlowRecord {
            id,
            timestamp,
            source_ip: pick_string(row, SOURCE_IP_ALIASES),
            source_port: parse_port(pick(row, SOURCE_PORT_ALIASES)),
            destination_ip: pick_string(row, DESTINATION_IP_ALIASES),
            destination_port: parse_port(pick(row, DESTINATION_PORT_ALIASES)),
            protocol: pick_string(row, PROTOCOL_ALIASES),
            application: pick_string(row, APPLICATION_ALIASES),
            category: pick_string(row, CATEGORY_ALIASES),
            bytes: parse_int(pick(row, BYTES_ALIASES)),
            packets: parse_int(pick(row, PACKETS_ALIASES)),
            duration: parse_float(pick(row, DURATION_ALIASES)),
            direction: pick_string(row, DIRECTION_ALIASES),
            client_name: pick_string(row, CLIENT_NAME_ALIASES),
            session_id: pick_string(row, SESSION_ID_ALIASES),
            action: pick_string(row, ACTION_ALIASES),
            raw,
        }),
        RecordType::Threats => CanonicalRecord::Threat(ThreatRecord {
            id,
            timestamp,
            source_ip: pick_string(row, SOURCE_IP_ALIASES),
            source_port: parse_port(pick(row, SOURCE_PORT_ALIASES)),
            destination_ip: pick_string(row, DESTINATION_IP_ALIASES),
            destination_port: parse_port(pick(row, DESTINATION_PORT_ALIASES)),
            protocol: pick_string(row, PROTOCOL_ALIASES),
            threat_type: pick_or(row, THREAT_TYPE_ALIASES, "unknown"),
            threat_category: pick_or(row, THREAT_CATEGORY_ALIASES, "unknown"),
            severity: pick_or(row, SEVERITY_ALIASES, "medium"),
            action: pick_or(row, ACTION_ALIASES, "blocked"),
            raw,
        }),
    }
}

/// Generate a record identifier. Not globally unique across processes, but
/// collisions within a single import run are negligible.
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// First alias with a non-empty value, in priority order
fn pick<'a>(row: &'a RawRow, aliases: &[&str]) -> Option<&'a str> {
    aliases
        .iter()
        .filter_map(|alias| row.get(*alias))
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
}

fn pick_string(row: &RawRow, aliases: &[&str]) -> String {
    pick(row, aliases).unwrap_or_default().to_string()
}

fn pick_or(row: &RawRow, aliases: &[&str], default: &str) -> String {
    pick(row, aliases).unwrap_or(default).to_string()
}

/// Permissive integer parse: accepts integer or float text, defaults to 0
fn parse_int(value: Option<&str>) -> i64 {
    let Some(value) = value else { return 0 };
    if let Ok(n) = value.parse::<i64>() {
        return n;
    }
    value.parse::<f64>().map(|f| f as i64).unwrap_or(0)
}

fn parse_port(value: Option<&str>) -> u16 {
    u16::try_from(parse_int(value)).unwrap_or(0)
}

fn parse_float(value: Option<&str>) -> f64 {
    value
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// Parse the timestamp column.
///
/// Tries standard formats first, then a month/day/year split on `/`, `-`
/// and `:` separators. Unparseable values fall back to the current instant
/// with a warning rather than failing the row.
pub fn parse_timestamp(value: Option<&str>) -> DateTime<Utc> {
    let Some(value) = value else {
        return Utc::now();
    };

    if let Some(parsed) = parse_known_formats(value) {
        return parsed;
    }
    if let Some(parsed) = parse_month_day_year(value) {
        return parsed;
    }

    tracing::warn!(timestamp = value, "unable to parse timestamp, using current time");
    Utc::now()
}

fn parse_known_formats(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}

/// Interpret the first three numeric groups as month/day/year (Western
/// convention, matching the exporter's CSV output)
fn parse_month_day_year(value: &str) -> Option<DateTime<Utc>> {
    let mut groups = value
        .split(['/', '-', ':'])
        .filter_map(|part| part.trim().parse::<i32>().ok());

    let month = groups.next()?;
    let day = groups.next()?;
    let year = groups.next()?;

    let date = NaiveDate::from_ymd_opt(year, u32::try_from(month).ok()?, u32::try_from(day).ok()?)?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    fn row(pairs: &[(&str, &str)]) -> RawRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn first_non_empty_alias_wins() {
        let r = row(&[
            ("sourceIP", ""),
            ("SourceIP", "1.2.3.4"),
            ("Source Address", "5.6.7.8"),
        ]);
        match normalize(&r, RecordType::Flows) {
            CanonicalRecord::Flow(f) => assert_eq!(f.source_ip, "1.2.3.4"),
            _ => panic!("expected flow"),
        }
    }

    #[test]
    fn numeric_fields_default_to_zero() {
        let r = row(&[("Bytes", ""), ("Packets", "not-a-number")]);
        match normalize(&r, RecordType::Flows) {
            CanonicalRecord::Flow(f) => {
                assert_eq!(f.bytes, 0);
                assert_eq!(f.packets, 0);
                assert_eq!(f.source_port, 0);
            }
            _ => panic!("expected flow"),
        }
    }

    #[test]
    fn permissive_parser_accepts_float_text_for_int_fields() {
        let r = row(&[("bytes", "1024.7")]);
        match normalize(&r, RecordType::Flows) {
            CanonicalRecord::Flow(f) => assert_eq!(f.bytes, 1024),
            _ => panic!("expected flow"),
        }
    }

    #[test]
    fn missing_timestamp_defaults_to_now() {
        let before = Utc::now();
        let record = normalize(&row(&[]), RecordType::Flows);
        let after = Utc::now();
        assert!(record.timestamp() >= before && record.timestamp() <= after);
    }

    #[test]
    fn month_day_year_fallback() {
        let ts = parse_timestamp(Some("03/15/2024"));
        assert_eq!((ts.month(), ts.day(), ts.year()), (3, 15, 2024));
    }

    #[test]
    fn rfc3339_timestamps_parse() {
        let ts = parse_timestamp(Some("2024-01-02T03:04:05Z"));
        assert_eq!(ts.to_rfc3339(), "2024-01-02T03:04:05+00:00");
    }

    #[test]
    fn garbage_timestamp_falls_back_to_now() {
        let before = Utc::now();
        let ts = parse_timestamp(Some("not a date"));
        assert!(ts >= before && ts <= Utc::now());
    }

    #[test]
    fn id_generated_when_absent_and_kept_when_present() {
        let with_id = row(&[("id", "abc123")]);
        assert_eq!(normalize(&with_id, RecordType::Flows).id(), "abc123");

        let a = normalize(&row(&[]), RecordType::Flows);
        let b = normalize(&row(&[]), RecordType::Flows);
        assert!(!a.id().is_empty());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn threat_defaults_apply() {
        let r = row(&[("sourceIP", "1.1.1.1")]);
        match normalize(&r, RecordType::Threats) {
            CanonicalRecord::Threat(t) => {
                assert_eq!(t.threat_type, "unknown");
                assert_eq!(t.threat_category, "unknown");
                assert_eq!(t.severity, "medium");
                assert_eq!(t.action, "blocked");
            }
            _ => panic!("expected threat"),
        }
    }

    #[test]
    fn raw_row_is_preserved() {
        let r = row(&[("Protocol", "tcp"), ("Custom Column", "kept")]);
        let record = normalize(&r, RecordType::Flows);
        match record {
            CanonicalRecord::Flow(f) => {
                assert_eq!(f.raw["Custom Column"], "kept");
                assert_eq!(f.protocol, "tcp");
            }
            _ => panic!("expected flow"),
        }
    }
}
