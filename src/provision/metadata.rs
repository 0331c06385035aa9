//! Instance metadata client
//!
//! Looks up the instance's public IPv4 from the EC2 Instance Metadata Service
//! (IMDS), trying IMDSv2 first and falling back to IMDSv1.

use reqwest::Client;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::InfraError;

/// EC2 metadata service base URL (link-local address)
pub const IMDS_BASE_URL: &str = "http://169.254.169.254";

/// Metadata path of the public IPv4 address
pub const PUBLIC_IPV4_PATH: &str = "public-ipv4";

/// URL of a metadata path under an IMDS endpoint
pub fn metadata_path_url(base_url: &str, path: &str) -> String {
    format!("{}/latest/meta-data/{}", base_url.trim_end_matches('/'), path)
}

/// IMDSv2 token TTL in seconds
const TOKEN_TTL_SECONDS: u32 = 300;

/// Client for the instance metadata service
pub struct MetadataClient {
    client: Client,
    base_url: String,
}

impl MetadataClient {
    /// Client for a custom endpoint
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, InfraError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .connect_timeout(Duration::from_secs(2))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Get IMDSv2 token for authenticated requests
    async fn get_imdsv2_token(&self) -> Option<String> {
        let url = format!("{}/latest/api/token", self.base_url);
        let response = self
            .client
            .put(&url)
            .header(
                "X-aws-ec2-metadata-token-ttl-seconds",
                TOKEN_TTL_SECONDS.to_string(),
            )
            .send()
            .await
            .ok()?;

        if response.status().is_success() {
            response.text().await.ok()
        } else {
            None
        }
    }

    /// Fetch a metadata path, trying IMDSv2 first then falling back to IMDSv1
    pub async fn fetch_metadata_path(&self, path: &str) -> Result<String, InfraError> {
        let url = metadata_path_url(&self.base_url, path);

        if let Some(token) = self.get_imdsv2_token().await {
            debug!("Using IMDSv2 for {}", path);
            let response = self
                .client
                .get(&url)
                .header("X-aws-ec2-metadata-token", &token)
                .send()
                .await?;

            if response.status().is_success() {
                return Ok(response.text().await?);
            }
        }

        debug!("Falling back to IMDSv1 for {}", path);
        let response = self.client.get(&url).send().await?;

        if response.status().is_success() {
            Ok(response.text().await?)
        } else {
            Err(InfraError::Http(format!(
                "Failed to fetch {}: {}",
                path,
                response.status()
            )))
        }
    }

    /// Public IPv4 of this instance
    pub async fn public_ipv4(&self) -> Result<Ipv4Addr, InfraError> {
        let body = self.fetch_metadata_path(PUBLIC_IPV4_PATH).await?;
        body.trim().parse().map_err(|_| {
            InfraError::Http(format!("Metadata returned an invalid IPv4 address: {:?}", body))
        })
    }

    /// Public IPv4 of this instance, or `fallback` when the lookup fails
    pub async fn public_ipv4_or(&self, fallback: &str) -> String {
        match self.public_ipv4().await {
            Ok(ip) => ip.to_string(),
            Err(e) => {
                warn!("Public IPv4 lookup failed ({}), using {}", e, fallback);
                fallback.to_string()
            }
        }
    }
}
