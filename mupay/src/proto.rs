//! Payer/merchant wire messages.
//!
//! JSON bodies exchanged over the transport. Field names are camelCase.
//! Addresses parse case-insensitively, so a payer is identified by the same
//! key regardless of checksum casing.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

/// Body of `POST /negotiate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateRequest {
    /// The proposing payer.
    pub payer: Address,
    /// Escrow contract the channel will be opened on.
    pub contract: Address,
    /// Settlement asset; the zero address denotes the native asset.
    pub token: Address,
    /// Amount the payer intends to escrow.
    pub amount: U256,
}

/// Reply to a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    /// Acceptance message.
    pub message: String,
    /// Address the channel must be opened for.
    pub merchant_address: Address,
}

/// Query of `GET /data`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataQuery {
    /// Optional resource selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
}

/// Body of `POST /payment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    /// The paying payer.
    pub payer_address: Address,
    /// The disclosed chain value.
    pub preimage: B256,
    /// Units paid by this disclosure.
    pub tokens_used: u64,
}

/// Reply to an accepted payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResponse {
    /// Acceptance message.
    pub message: String,
    /// Cumulative units accepted on the channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens_used: Option<u64>,
}

/// Body of `POST /redeem`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemRequest {
    /// The payer whose channel should be settled.
    pub payer_address: Address,
}

/// Reply to a confirmed redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemResponse {
    /// Confirmation message.
    pub message: String,
    /// Redemption transaction hash.
    pub tx_hash: B256,
    /// Units released to the merchant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
}

/// Error body returned on any rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short error description.
    pub error: String,
    /// Underlying cause, when there is one worth surfacing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    /// An error body without details.
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    /// Attaches details.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_request_wire_names() {
        let json = r#"{
            "payerAddress": "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
            "preimage": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "tokensUsed": 2
        }"#;
        let request: PaymentRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.payer_address, Address::repeat_byte(0xaa));
        assert_eq!(request.preimage, B256::repeat_byte(0x11));
        assert_eq!(request.tokens_used, 2);
    }

    #[test]
    fn test_address_casing_is_canonicalised() {
        let lower: RedeemRequest = serde_json::from_str(
            r#"{"payerAddress":"0xabcdefabcdefabcdefabcdefabcdefabcdefabcd"}"#,
        )
        .unwrap();
        let upper: RedeemRequest = serde_json::from_str(
            r#"{"payerAddress":"0xABCDEFABCDEFABCDEFABCDEFABCDEFABCDEFABCD"}"#,
        )
        .unwrap();
        assert_eq!(lower, upper);
    }

    #[test]
    fn test_negotiate_response_shape() {
        let response = NegotiateResponse {
            message: "Terms accepted.".into(),
            merchant_address: Address::repeat_byte(0x01),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["message"], "Terms accepted.");
        assert!(value.get("merchantAddress").is_some());
    }

    #[test]
    fn test_error_response_omits_empty_details() {
        let value = serde_json::to_value(ErrorResponse::new("boom")).unwrap();
        assert_eq!(value, serde_json::json!({ "error": "boom" }));
        let value = serde_json::to_value(ErrorResponse::new("boom").with_details("why")).unwrap();
        assert_eq!(value["details"], "why");
    }
}
