//! Core data models for flow and threat imports

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of records an import produces
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Flows,
    Threats,
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordType::Flows => write!(f, "flows"),
            RecordType::Threats => write!(f, "threats"),
        }
    }
}

impl std::str::FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "flows" | "flow" => Ok(RecordType::Flows),
            "threats" | "threat" => Ok(RecordType::Threats),
            other => Err(format!("unknown record type: {other}")),
        }
    }
}

/// Normalized network flow record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source_ip: String,
    pub source_port: u16,
    pub destination_ip: String,
    pub destination_port: u16,
    pub protocol: String,
    pub application: String,
    pub category: String,
    pub bytes: i64,
    pub packets: i64,
    pub duration: f64,
    pub direction: String,
    pub client_name: String,
    pub session_id: String,
    pub action: String,
    /// Original CSV row, kept for traceability
    pub raw: serde_json::Value,
}

/// Normalized security threat record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source_ip: String,
    pub source_port: u16,
    pub destination_ip: String,
    pub destination_port: u16,
    pub protocol: String,
    pub threat_type: String,
    pub threat_category: String,
    pub severity: String,
    pub action: String,
    /// Original CSV row, kept for traceability
    pub raw: serde_json::Value,
}

/// A record in canonical shape, ready for enrichment and storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CanonicalRecord {
    Flow(FlowRecord),
    Threat(ThreatRecord),
}

impl CanonicalRecord {
    pub fn record_type(&self) -> RecordType {
        match self {
            CanonicalRecord::Flow(_) => RecordType::Flows,
            CanonicalRecord::Threat(_) => RecordType::Threats,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            CanonicalRecord::Flow(f) => &f.id,
            CanonicalRecord::Threat(t) => &t.id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CanonicalRecord::Flow(f) => f.timestamp,
            CanonicalRecord::Threat(t) => t.timestamp,
        }
    }

    pub fn source_ip(&self) -> &str {
        match self {
            CanonicalRecord::Flow(f) => &f.source_ip,
            CanonicalRecord::Threat(t) => &t.source_ip,
        }
    }

    pub fn destination_ip(&self) -> &str {
        match self {
            CanonicalRecord::Flow(f) => &f.destination_ip,
            CanonicalRecord::Threat(t) => &t.destination_ip,
        }
    }
}

/// Geolocation lookup result for a single address.
///
/// Field names are part of the on-disk cache format; renaming them would
/// invalidate existing cache files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeoResult {
    pub ip: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub isp: Option<String>,
    pub asn: Option<String>,
}

impl GeoResult {
    /// Geo data is only attached to stored points when both coordinates
    /// are present.
    pub fn has_coordinates(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

/// Per-record enrichment, one optional result per address role
#[derive(Debug, Clone, Default)]
pub struct RecordGeo {
    pub source: Option<GeoResult>,
    pub destination: Option<GeoResult>,
}

/// Outcome counters for one import invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResult {
    pub total: u64,
    pub imported: u64,
    pub errors: u64,
    pub record_type: RecordType,
}

impl ImportResult {
    pub fn new(record_type: RecordType) -> Self {
        Self {
            total: 0,
            imported: 0,
            errors: 0,
            record_type,
        }
    }
}

/// Process-wide record of the most recent completed import
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastImport {
    pub file: String,
    pub timestamp: DateTime<Utc>,
    pub result: ImportResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_type_round_trips_through_strings() {
        assert_eq!("flows".parse::<RecordType>().unwrap(), RecordType::Flows);
        assert_eq!("Threats".parse::<RecordType>().unwrap(), RecordType::Threats);
        assert_eq!(RecordType::Flows.to_string(), "flows");
        assert!("packets".parse::<RecordType>().is_err());
    }

    #[test]
    fn geo_result_requires_both_coordinates() {
        let mut geo = GeoResult {
            ip: "8.8.8.8".into(),
            latitude: Some(1.0),
            longitude: None,
            country: None,
            city: None,
            isp: None,
            asn: None,
        };
        assert!(!geo.has_coordinates());
        geo.longitude = Some(2.0);
        assert!(geo.has_coordinates());
    }
}
