//! A [`MerchantTransport`] that talks to a _remote_ merchant over HTTP.
//!
//! [`MerchantClient`] handles the `/negotiate`, `/data`, `/payment` and
//! `/redeem` endpoints of a merchant agent. Each endpoint has its own request
//! timeout.
//!
//! ## Error Handling
//!
//! [`MerchantClientError`] captures the failing exchange and the cause:
//! - URL construction
//! - HTTP transport failures (including timeouts)
//! - JSON deserialization errors
//! - Unexpected HTTP status responses, with the merchant's error message

use std::time::Duration;

use alloy_primitives::Address;
use http::StatusCode;
use mupay::{Channel, TransportError};
use mupay::payer::MerchantTransport;
use mupay::proto::{
    DataQuery, ErrorResponse, NegotiateRequest, NegotiateResponse, PaymentRequest,
    PaymentResponse, RedeemRequest, RedeemResponse,
};
use reqwest::Client;
use serde_json::Value;
#[cfg(feature = "telemetry")]
use tracing::instrument;
use url::Url;

use crate::constants::{DATA_TIMEOUT, NEGOTIATE_TIMEOUT, PAYMENT_TIMEOUT, REDEEM_TIMEOUT};

/// Per-endpoint request timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// `POST /negotiate`.
    pub negotiate: Duration,
    /// `GET /data`.
    pub data: Duration,
    /// `POST /payment`.
    pub payment: Duration,
    /// `POST /redeem`.
    pub redeem: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            negotiate: NEGOTIATE_TIMEOUT,
            data: DATA_TIMEOUT,
            payment: PAYMENT_TIMEOUT,
            redeem: REDEEM_TIMEOUT,
        }
    }
}

/// Errors that can occur while talking to a merchant.
#[derive(Debug, thiserror::Error)]
pub enum MerchantClientError {
    /// URL parse error.
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        /// Human-readable context.
        context: &'static str,
        /// The underlying parse error.
        #[source]
        source: url::ParseError,
    },
    /// HTTP transport error.
    #[error("HTTP error: {context}: {source}")]
    Http {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// JSON deserialization error.
    #[error("Failed to deserialize JSON: {context}: {source}")]
    JsonDeserialization {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// Unexpected HTTP status code.
    #[error("Unexpected HTTP status {status}: {context}: {body}")]
    HttpStatus {
        /// Human-readable context.
        context: &'static str,
        /// The HTTP status code.
        status: StatusCode,
        /// The response body.
        body: String,
    },
    /// Failed to read response body.
    #[error("Failed to read response body as text: {context}: {source}")]
    ResponseBodyRead {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
}

impl MerchantClientError {
    /// The exchange that failed.
    #[must_use]
    pub const fn context(&self) -> &'static str {
        match self {
            Self::UrlParse { context, .. }
            | Self::Http { context, .. }
            | Self::JsonDeserialization { context, .. }
            | Self::HttpStatus { context, .. }
            | Self::ResponseBodyRead { context, .. } => context,
        }
    }

    /// The merchant's HTTP status, if it answered with an error.
    #[must_use]
    pub const fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<MerchantClientError> for TransportError {
    fn from(err: MerchantClientError) -> Self {
        match &err {
            MerchantClientError::HttpStatus {
                context,
                status,
                body,
            } => {
                // Prefer the merchant's own error message over the raw body.
                let message = serde_json::from_str::<ErrorResponse>(body).map_or_else(
                    |_| body.clone(),
                    |e| match e.details {
                        Some(details) => format!("{}: {details}", e.error),
                        None => e.error,
                    },
                );
                Self::new(context, message).with_status(status.as_u16())
            }
            _ => Self::new(err.context(), err.to_string()),
        }
    }
}

/// A client for communicating with a remote merchant agent.
#[derive(Clone, Debug)]
pub struct MerchantClient {
    /// Base URL of the merchant (e.g. `http://localhost:3001/`)
    base_url: Url,
    /// Full URL to `POST /negotiate` requests
    negotiate_url: Url,
    /// Full URL to `GET /data` requests
    data_url: Url,
    /// Full URL to `POST /payment` requests
    payment_url: Url,
    /// Full URL to `POST /redeem` requests
    redeem_url: Url,
    /// Shared Reqwest HTTP client
    client: Client,
    timeouts: Timeouts,
}

impl MerchantClient {
    /// Returns the base URL used by this client.
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Returns the configured timeouts.
    pub const fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Constructs a new [`MerchantClient`] from a base URL.
    ///
    /// # Errors
    ///
    /// Returns [`MerchantClientError`] if URL construction fails.
    pub fn try_new(base_url: Url) -> Result<Self, MerchantClientError> {
        let join = |path: &str, context: &'static str| {
            base_url
                .join(path)
                .map_err(|e| MerchantClientError::UrlParse { context, source: e })
        };
        let negotiate_url = join("./negotiate", "Failed to construct ./negotiate URL")?;
        let data_url = join("./data", "Failed to construct ./data URL")?;
        let payment_url = join("./payment", "Failed to construct ./payment URL")?;
        let redeem_url = join("./redeem", "Failed to construct ./redeem URL")?;
        Ok(Self {
            base_url,
            negotiate_url,
            data_url,
            payment_url,
            redeem_url,
            client: Client::new(),
            timeouts: Timeouts::default(),
        })
    }

    /// Replaces the per-endpoint timeouts.
    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Sends a `POST /negotiate` request.
    ///
    /// # Errors
    ///
    /// Returns [`MerchantClientError`] if the HTTP request fails.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "mupay.merchant_client.negotiate", skip_all, err)
    )]
    pub async fn negotiate(
        &self,
        request: &NegotiateRequest,
    ) -> Result<NegotiateResponse, MerchantClientError> {
        self.post_json(
            &self.negotiate_url,
            "POST /negotiate",
            request,
            self.timeouts.negotiate,
        )
        .await
    }

    /// Sends a `GET /data` request.
    ///
    /// # Errors
    ///
    /// Returns [`MerchantClientError`] if the HTTP request fails.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "mupay.merchant_client.data", skip_all, err)
    )]
    pub async fn data(&self, query: &DataQuery) -> Result<Value, MerchantClientError> {
        self.get_json(&self.data_url, "GET /data", query, self.timeouts.data)
            .await
    }

    /// Sends a `POST /payment` request.
    ///
    /// # Errors
    ///
    /// Returns [`MerchantClientError`] if the HTTP request fails.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "mupay.merchant_client.payment", skip_all, fields(steps = request.tokens_used), err)
    )]
    pub async fn payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentResponse, MerchantClientError> {
        self.post_json(
            &self.payment_url,
            "POST /payment",
            request,
            self.timeouts.payment,
        )
        .await
    }

    /// Sends a `POST /redeem` request.
    ///
    /// # Errors
    ///
    /// Returns [`MerchantClientError`] if the HTTP request fails.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "mupay.merchant_client.redeem", skip_all, err)
    )]
    pub async fn redeem(
        &self,
        request: &RedeemRequest,
    ) -> Result<RedeemResponse, MerchantClientError> {
        self.post_json(
            &self.redeem_url,
            "POST /redeem",
            request,
            self.timeouts.redeem,
        )
        .await
    }

    /// Sends a `GET /channels/{payer}` request.
    ///
    /// Returns `None` while the merchant has not registered the channel.
    ///
    /// # Errors
    ///
    /// Returns [`MerchantClientError`] if the HTTP request fails.
    pub async fn channel(&self, payer: Address) -> Result<Option<Channel>, MerchantClientError> {
        let context = "GET /channels/{payer}";
        let url = self
            .base_url
            .join(&format!("./channels/{payer}"))
            .map_err(|e| MerchantClientError::UrlParse { context, source: e })?;
        match self
            .get_json(&url, context, &DataQuery::default(), self.timeouts.data)
            .await
        {
            Ok(channel) => Ok(Some(channel)),
            Err(MerchantClientError::HttpStatus { status, .. }) if status == StatusCode::NOT_FOUND => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Generic POST helper that handles JSON serialization, error mapping and
    /// timeout application.
    ///
    /// `context` is a human-readable identifier used in error messages (e.g. `"POST /payment"`).
    async fn post_json<T, R>(
        &self,
        url: &Url,
        context: &'static str,
        payload: &T,
        timeout: Duration,
    ) -> Result<R, MerchantClientError>
    where
        T: serde::Serialize + Sync + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let http_response = self
            .client
            .post(url.clone())
            .json(payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| MerchantClientError::Http { context, source: e })?;
        Self::read_json(http_response, context).await
    }

    /// Generic GET helper with query parameters.
    ///
    /// `context` is a human-readable identifier used in error messages (e.g. `"GET /data"`).
    async fn get_json<Q, R>(
        &self,
        url: &Url,
        context: &'static str,
        query: &Q,
        timeout: Duration,
    ) -> Result<R, MerchantClientError>
    where
        Q: serde::Serialize + Sync + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let http_response = self
            .client
            .get(url.clone())
            .query(query)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| MerchantClientError::Http { context, source: e })?;
        Self::read_json(http_response, context).await
    }

    async fn read_json<R>(
        http_response: reqwest::Response,
        context: &'static str,
    ) -> Result<R, MerchantClientError>
    where
        R: serde::de::DeserializeOwned,
    {
        if http_response.status() == StatusCode::OK {
            http_response
                .json::<R>()
                .await
                .map_err(|e| MerchantClientError::JsonDeserialization { context, source: e })
        } else {
            let status = http_response.status();
            let body = http_response
                .text()
                .await
                .map_err(|e| MerchantClientError::ResponseBodyRead { context, source: e })?;
            Err(MerchantClientError::HttpStatus {
                context,
                status,
                body,
            })
        }
    }
}

impl MerchantTransport for MerchantClient {
    async fn negotiate(
        &self,
        request: &NegotiateRequest,
    ) -> Result<NegotiateResponse, TransportError> {
        Ok(Self::negotiate(self, request).await?)
    }

    async fn fetch_data(&self, query: &DataQuery) -> Result<Value, TransportError> {
        Ok(Self::data(self, query).await?)
    }

    async fn pay(&self, request: &PaymentRequest) -> Result<PaymentResponse, TransportError> {
        Ok(Self::payment(self, request).await?)
    }

    async fn redeem(&self, request: &RedeemRequest) -> Result<RedeemResponse, TransportError> {
        Ok(Self::redeem(self, request).await?)
    }
}

/// Converts a string URL into a `MerchantClient`, parsing the URL and calling `try_new`.
impl TryFrom<&str> for MerchantClient {
    type Error = MerchantClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        // Normalize: strip trailing slashes and add a single trailing slash
        let mut normalized = value.trim_end_matches('/').to_string();
        normalized.push('/');
        let url = Url::parse(&normalized).map_err(|e| MerchantClientError::UrlParse {
            context: "Failed to parse base url",
            source: e,
        })?;
        Self::try_new(url)
    }
}
