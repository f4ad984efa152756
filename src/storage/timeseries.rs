//! Time-series storage over the InfluxDB v2 HTTP write API
//!
//! Each record becomes one line-protocol point tagged with its addresses
//! and protocol. Points buffer in memory and go out in a single write per
//! completed import; a failed flush counts the buffered points as lost
//! rather than failing the import.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::Mutex;

use crate::models::{CanonicalRecord, FlowRecord, GeoResult, RecordGeo, ThreatRecord};
use crate::storage::StorageBackend;

const FLOW_MEASUREMENT: &str = "network_flow";
const THREAT_MEASUREMENT: &str = "network_threat";

/// Connection parameters for the InfluxDB v2 write endpoint
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
}

pub struct TimeSeriesStore {
    client: Client,
    config: InfluxConfig,
    buffer: Mutex<Vec<String>>,
}

impl TimeSeriesStore {
    /// A missing token is a fatal configuration error, raised once here
    /// rather than per record.
    pub fn new(config: InfluxConfig) -> Result<Self> {
        if config.token.is_empty() {
            bail!("InfluxDB token is required when the timeseries storage mode is selected");
        }

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Ok(Self {
            client,
            config,
            buffer: Mutex::new(Vec::new()),
        })
    }

    async fn post_lines(&self, body: String) -> Result<()> {
        let url = format!("{}/api/v2/write", self.config.url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .query(&[
                ("org", self.config.org.as_str()),
                ("bucket", self.config.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Authorization", format!("Token {}", self.config.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .context("failed to send points to InfluxDB")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("InfluxDB write error: {status} - {body}");
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for TimeSeriesStore {
    fn name(&self) -> &'static str {
        "timeseries"
    }

    async fn write(&self, record: &CanonicalRecord, geo: &RecordGeo) -> Result<()> {
        let line = match record {
            CanonicalRecord::Flow(f) => flow_line(f, geo),
            CanonicalRecord::Threat(t) => threat_line(t, geo),
        };
        self.buffer.lock().await.push(line);
        Ok(())
    }

    async fn flush(&self) -> u64 {
        let lines = std::mem::take(&mut *self.buffer.lock().await);
        if lines.is_empty() {
            return 0;
        }

        let count = lines.len() as u64;
        match self.post_lines(lines.join("\n")).await {
            Ok(()) => {
                tracing::debug!(points = count, "flushed points to InfluxDB");
                0
            }
            Err(e) => {
                tracing::warn!(points = count, error = %e, "InfluxDB flush failed");
                count
            }
        }
    }
}

/// Line-protocol point under construction
struct Point {
    line: String,
    fields: Vec<String>,
}

impl Point {
    fn new(measurement: &str) -> Self {
        Self {
            line: measurement.to_string(),
            fields: Vec::new(),
        }
    }

    fn tag(&mut self, key: &str, value: &str) -> &mut Self {
        let value = if value.is_empty() { "unknown" } else { value };
        self.line.push(',');
        self.line.push_str(key);
        self.line.push('=');
        self.line.push_str(&escape_tag(value));
        self
    }

    fn tag_opt(&mut self, key: &str, value: Option<&str>) -> &mut Self {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            self.tag(key, value);
        }
        self
    }

    fn int_field(&mut self, key: &str, value: i64) -> &mut Self {
        self.fields.push(format!("{key}={value}i"));
        self
    }

    fn float_field(&mut self, key: &str, value: f64) -> &mut Self {
        self.fields.push(format!("{key}={value}"));
        self
    }

    fn string_field(&mut self, key: &str, value: &str) -> &mut Self {
        if !value.is_empty() {
            self.fields.push(format!("{key}={}", escape_field_string(value)));
        }
        self
    }

    /// Geo tags and coordinate fields for one address role. Only attached
    /// when both coordinates are present; city and ISP are independently
    /// optional.
    fn geo(&mut self, prefix: &str, geo: Option<&GeoResult>) -> &mut Self {
        let Some(geo) = geo.filter(|g| g.has_coordinates()) else {
            return self;
        };
        self.tag(
            &format!("{prefix}Country"),
            geo.country.as_deref().unwrap_or("unknown"),
        );
        self.tag_opt(&format!("{prefix}City"), geo.city.as_deref());
        self.tag_opt(&format!("{prefix}ISP"), geo.isp.as_deref());
        if let (Some(lat), Some(lon)) = (geo.latitude, geo.longitude) {
            self.float_field(&format!("{prefix}Latitude"), lat);
            self.float_field(&format!("{prefix}Longitude"), lon);
        }
        self
    }

    fn finish(mut self, timestamp_ns: i64) -> String {
        self.line.push(' ');
        self.line.push_str(&self.fields.join(","));
        self.line.push(' ');
        self.line.push_str(&timestamp_ns.to_string());
        self.line
    }
}

fn timestamp_ns(ts: chrono::DateTime<chrono::Utc>) -> i64 {
    ts.timestamp_nanos_opt()
        .unwrap_or_else(|| ts.timestamp_millis().saturating_mul(1_000_000))
}

fn flow_line(flow: &FlowRecord, geo: &RecordGeo) -> String {
    let mut point = Point::new(FLOW_MEASUREMENT);
    point
        .tag("sourceAddress", &flow.source_ip)
        .tag("destinationAddress", &flow.destination_ip)
        .tag("protocol", &flow.protocol)
        .tag("application", &flow.application)
        .geo("source", geo.source.as_ref())
        .geo("dest", geo.destination.as_ref())
        .int_field("bytes", flow.bytes)
        .int_field("packets", flow.packets)
        .int_field("sourcePort", flow.source_port as i64)
        .int_field("destinationPort", flow.destination_port as i64);
    if flow.duration != 0.0 {
        point.float_field("duration", flow.duration);
    }
    point
        .string_field("direction", &flow.direction)
        .string_field("clientName", &flow.client_name)
        .string_field("category", &flow.category)
        .string_field("action", &flow.action);

    point.finish(timestamp_ns(flow.timestamp))
}

fn threat_line(threat: &ThreatRecord, geo: &RecordGeo) -> String {
    let mut point = Point::new(THREAT_MEASUREMENT);
    point
        .tag("sourceAddress", &threat.source_ip)
        .tag("destinationAddress", &threat.destination_ip)
        .tag("protocol", &threat.protocol)
        .tag("threatType", &threat.threat_type)
        .tag("threatCategory", &threat.threat_category)
        .tag("severity", &threat.severity)
        .geo("source", geo.source.as_ref())
        .geo("dest", geo.destination.as_ref())
        .int_field("sourcePort", threat.source_port as i64)
        .int_field("destinationPort", threat.destination_port as i64)
        .string_field("action", &threat.action);

    point.finish(timestamp_ns(threat.timestamp))
}

fn escape_tag(value: &str) -> String {
    value
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn escape_field_string(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}
