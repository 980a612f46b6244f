//! Error types for the merchant server.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use mupay::ChannelError;
use mupay::proto::ErrorResponse;

/// Errors returned by the merchant's HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum MerchantError {
    /// Request body missing fields or not valid JSON.
    #[error("{expected}")]
    InvalidBody {
        /// What the endpoint requires, e.g. `payerAddress is required.`
        expected: &'static str,
        /// The extractor's rejection.
        #[source]
        source: JsonRejection,
    },

    /// Query string could not be parsed.
    #[error("invalid query: {0}")]
    InvalidQuery(#[from] QueryRejection),

    /// Path parameter could not be parsed.
    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathRejection),

    /// `/data` was called without an address.
    #[error("Missing address query parameter")]
    MissingAddress,

    /// Protocol-level failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The proxied resource could not be fetched.
    #[error("Failed to fetch resource data.")]
    Upstream(#[source] reqwest::Error),
}

impl MerchantError {
    /// Wraps a body rejection with the endpoint's requirement message.
    #[must_use]
    pub const fn invalid_body(expected: &'static str, source: JsonRejection) -> Self {
        Self::InvalidBody { expected, source }
    }

    /// HTTP status for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidBody { .. }
            | Self::InvalidQuery(_)
            | Self::InvalidPath(_)
            | Self::MissingAddress => StatusCode::BAD_REQUEST,
            Self::Channel(err) => match err {
                ChannelError::ChannelNotFound(_) => StatusCode::NOT_FOUND,
                ChannelError::InvalidToken { .. }
                | ChannelError::NothingToSettle(_)
                | ChannelError::InvalidConfiguration(_) => StatusCode::BAD_REQUEST,
                ChannelError::DuplicateChannel(_) | ChannelError::InvalidState { .. } => {
                    StatusCode::CONFLICT
                }
                ChannelError::ExternalLedger(_) | ChannelError::Transport(_) => {
                    StatusCode::BAD_GATEWAY
                }
            },
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// The JSON body sent to the client.
    #[must_use]
    pub fn body(&self) -> ErrorResponse {
        match self {
            Self::InvalidBody { expected, source } => {
                ErrorResponse::new(*expected).with_details(source.body_text())
            }
            Self::Channel(ChannelError::ChannelNotFound(_)) => {
                ErrorResponse::new("No active channel found for this payer.")
            }
            Self::Channel(ChannelError::InvalidToken { reason, .. }) => {
                ErrorResponse::new("Invalid token. Hashchain verification failed.")
                    .with_details(reason.to_string())
            }
            Self::Channel(ChannelError::NothingToSettle(_)) => {
                ErrorResponse::new("No payments have been made on this channel.")
            }
            Self::Channel(ChannelError::ExternalLedger(err)) => {
                ErrorResponse::new("Failed to redeem channel.").with_details(err.message.clone())
            }
            Self::Upstream(err) => ErrorResponse::new(self.to_string()).with_details(err.to_string()),
            _ => ErrorResponse::new(self.to_string()),
        }
    }
}

impl IntoResponse for MerchantError {
    fn into_response(self) -> Response {
        let status = self.status();
        #[cfg(feature = "telemetry")]
        if status.is_server_error() {
            tracing::warn!(error = %self, "Request failed");
        }
        (status, axum::Json(self.body())).into_response()
    }
}
