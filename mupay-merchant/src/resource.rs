//! The metered resource served on `GET /data`.
//!
//! With an upstream configured, the request is proxied as a `GET` carrying the
//! requested address (plus any static query parameters) and a bearer token.
//! Otherwise a small local payload is returned.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy_primitives::Address;
use reqwest::Client;
use serde_json::Value;
use url::Url;

use crate::config::ResourceConfig;
use crate::error::MerchantError;

/// Source of `/data` responses.
#[derive(Debug, Clone)]
pub enum Resource {
    /// Answers locally.
    Local,
    /// Proxies an upstream API.
    Upstream(Upstream),
}

/// Upstream API proxied by `/data`.
#[derive(Debug, Clone)]
pub struct Upstream {
    client: Client,
    url: Url,
    api_key: Option<String>,
    address_param: String,
    query: Vec<(String, String)>,
    timeout: Duration,
}

impl Resource {
    /// Builds the resource described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`mupay::ChannelError::InvalidConfiguration`] for a malformed upstream URL.
    pub fn from_config(config: &ResourceConfig) -> Result<Self, mupay::ChannelError> {
        let Some(upstream) = &config.upstream_url else {
            return Ok(Self::Local);
        };
        let url = upstream.parse().map_err(|e| {
            mupay::ChannelError::InvalidConfiguration(format!(
                "invalid upstream_url {upstream:?}: {e}"
            ))
        })?;
        let mut query: Vec<(String, String)> = config
            .query
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        query.sort();
        Ok(Self::Upstream(Upstream {
            client: Client::new(),
            url,
            api_key: config.api_key.clone().filter(|key| !key.trim().is_empty()),
            address_param: config.address_param.clone(),
            query,
            timeout: Duration::from_secs(config.timeout_secs),
        }))
    }

    /// Fetches the resource for `address`.
    ///
    /// # Errors
    ///
    /// Returns [`MerchantError::Upstream`] if the upstream request fails or
    /// answers with a non-success status.
    pub async fn fetch(&self, address: Address) -> Result<Value, MerchantError> {
        match self {
            Self::Local => {
                let served_at = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_or(0, |d| d.as_secs());
                Ok(serde_json::json!({
                    "address": address,
                    "servedAt": served_at,
                }))
            }
            Self::Upstream(upstream) => upstream.fetch(address).await,
        }
    }
}

impl Upstream {
    async fn fetch(&self, address: Address) -> Result<Value, MerchantError> {
        #[cfg(feature = "telemetry")]
        tracing::info!(address = %address, "Fetching resource data");
        let address = address.to_string();
        let mut req = self
            .client
            .get(self.url.clone())
            .query(&[(self.address_param.as_str(), address.as_str())])
            .query(&self.query)
            .timeout(self.timeout);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(MerchantError::Upstream)?;
        response.json().await.map_err(MerchantError::Upstream)
    }
}
