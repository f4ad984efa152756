//! External geolocation provider clients
//!
//! Two free HTTP APIs with differing response schemas, both mapped into
//! the shared [`GeoResult`] shape. Any failure — transport error, non-2xx
//! status, provider-reported error, parse failure — resolves to `None` so
//! the caller can fall through to the next provider in the chain.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::models::GeoResult;

const IPAPI_CO_BASE: &str = "https://ipapi.co";
const IP_API_COM_BASE: &str = "http://ip-api.com";

/// One external geolocation service
#[async_trait]
pub trait GeoProvider: Send + Sync {
    /// Provider name, for logs and diagnostics
    fn name(&self) -> &'static str;

    /// Look up one address. `None` means "try the next provider".
    async fn fetch(&self, ip: &str) -> Option<GeoResult>;
}

fn http_client() -> Client {
    Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .expect("Failed to create HTTP client")
}

// ==================== ipapi.co ====================

/// ipapi.co response (subset)
#[derive(Debug, Deserialize)]
struct IpapiCoResponse {
    #[serde(default)]
    error: bool,
    latitude: Option<f64>,
    longitude: Option<f64>,
    country_code: Option<String>,
    city: Option<String>,
    org: Option<String>,
    asn: Option<String>,
}

/// ipapi.co client (30,000 requests/month free quota)
pub struct IpapiCoProvider {
    client: Client,
    base_url: String,
}

impl IpapiCoProvider {
    pub fn new() -> Self {
        Self::with_base_url(IPAPI_CO_BASE.to_string())
    }

    /// Point the client at a different endpoint, for stubbed tests
    pub fn with_base_url(base_url: String) -> Self {
        Self {
            client: http_client(),
            base_url,
        }
    }

    async fn request(&self, ip: &str) -> anyhow::Result<Option<GeoResult>> {
        let url = format!("{}/{}/json/", self.base_url, ip);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            tracing::debug!(ip, status = %response.status(), "ipapi.co returned non-success status");
            return Ok(None);
        }

        let body: IpapiCoResponse = response.json().await?;
        if body.error {
            return Ok(None);
        }

        Ok(Some(GeoResult {
            ip: ip.to_string(),
            latitude: body.latitude,
            longitude: body.longitude,
            country: body.country_code,
            city: body.city,
            isp: body.org,
            asn: body.asn,
        }))
    }
}

impl Default for IpapiCoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GeoProvider for IpapiCoProvider {
    fn name(&self) -> &'static str {
        "ipapi.co"
    }

    async fn fetch(&self, ip: &str) -> Option<GeoResult> {
        match self.request(ip).await {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!(ip, error = %e, "ipapi.co lookup failed");
                None
            }
        }
    }
}

// ==================== ip-api.com ====================

/// ip-api.com response for the requested field set
#[derive(Debug, Deserialize)]
struct IpApiComResponse {
    status: String,
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(rename = "countryCode")]
    country_code: Option<String>,
    city: Option<String>,
    isp: Option<String>,
    #[serde(rename = "as")]
    asn: Option<String>,
}

/// ip-api.com client (45 requests/minute free quota)
pub struct IpApiComProvider {
    client: Client,
    base_url: String,
}

impl IpApiComProvider {
    pub fn new() -> Self {
        Self::with_base_url(IP_API_COM_BASE.to_string())
    }

    /// Point the client at a different endpoint, for stubbed tests
    pub fn with_base_url(base_url: String) -> Self {
        Self {
            client: http_client(),
            base_url,
        }
    }

    async fn request(&self, ip: &str) -> anyhow::Result<Option<GeoResult>> {
        let url = format!(
            "{}/json/{}?fields=status,message,country,countryCode,city,lat,lon,isp,as",
            self.base_url, ip
        );
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            tracing::debug!(ip, status = %response.status(), "ip-api.com returned non-success status");
            return Ok(None);
        }

        let body: IpApiComResponse = response.json().await?;
        if body.status != "success" {
            return Ok(None);
        }

        Ok(Some(GeoResult {
            ip: ip.to_string(),
            latitude: body.lat,
            longitude: body.lon,
            country: body.country_code,
            city: body.city,
            isp: body.isp,
            asn: body.asn,
        }))
    }
}

impl Default for IpApiComProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GeoProvider for IpApiComProvider {
    fn name(&self) -> &'static str {
        "ip-api.com"
    }

    async fn fetch(&self, ip: &str) -> Option<GeoResult> {
        match self.request(ip).await {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!(ip, error = %e, "ip-api.com lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn ipapi_co_maps_response_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/8.8.8.8/json/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "latitude": 37.4,
                "longitude": -122.0,
                "country_code": "US",
                "city": "Mountain View",
                "org": "Google LLC",
                "asn": "AS15169"
            })))
            .mount(&server)
            .await;

        let provider = IpapiCoProvider::with_base_url(server.uri());
        let result = provider.fetch("8.8.8.8").await.unwrap();
        assert_eq!(result.country.as_deref(), Some("US"));
        assert_eq!(result.isp.as_deref(), Some("Google LLC"));
        assert_eq!(result.latitude, Some(37.4));
    }

    #[tokio::test]
    async fn ipapi_co_error_body_resolves_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error": true,
                "reason": "Reserved IP Address"
            })))
            .mount(&server)
            .await;

        let provider = IpapiCoProvider::with_base_url(server.uri());
        assert!(provider.fetch("8.8.8.8").await.is_none());
    }

    #[tokio::test]
    async fn non_success_status_resolves_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let provider = IpapiCoProvider::with_base_url(server.uri());
        assert!(provider.fetch("8.8.8.8").await.is_none());
    }

    #[tokio::test]
    async fn ip_api_com_maps_response_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json/1.1.1.1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "lat": -33.8,
                "lon": 151.2,
                "countryCode": "AU",
                "city": "Sydney",
                "isp": "Cloudflare",
                "as": "AS13335 Cloudflare, Inc."
            })))
            .mount(&server)
            .await;

        let provider = IpApiComProvider::with_base_url(server.uri());
        let result = provider.fetch("1.1.1.1").await.unwrap();
        assert_eq!(result.country.as_deref(), Some("AU"));
        assert_eq!(result.asn.as_deref(), Some("AS13335 Cloudflare, Inc."));
        assert_eq!(result.longitude, Some(151.2));
    }

    #[tokio::test]
    async fn ip_api_com_failure_status_resolves_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "fail",
                "message": "private range"
            })))
            .mount(&server)
            .await;

        let provider = IpApiComProvider::with_base_url(server.uri());
        assert!(provider.fetch("10.0.0.1").await.is_none());
    }

    #[tokio::test]
    async fn malformed_json_resolves_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let provider = IpApiComProvider::with_base_url(server.uri());
        assert!(provider.fetch("1.1.1.1").await.is_none());
    }
}
