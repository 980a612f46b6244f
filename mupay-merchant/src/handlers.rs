//! Axum route handlers for the merchant agent.
//!
//! Every handler delegates to [`Merchant`]; this module only maps HTTP
//! extraction failures and protocol errors to responses.

use std::sync::Arc;

use alloy_primitives::Address;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use mupay::proto::{
    DataQuery, NegotiateRequest, NegotiateResponse, PaymentRequest, PaymentResponse,
    RedeemRequest, RedeemResponse,
};
use mupay::{Channel, ChannelContract, ChannelError, Merchant};
use mupay_http::constants::{
    CHANNEL_PATH, CHANNELS_PATH, DATA_PATH, HEALTH_PATH, NEGOTIATE_PATH, PAYMENT_PATH,
    REDEEM_PATH,
};
use serde_json::Value;

use crate::error::MerchantError;
use crate::resource::Resource;

/// Everything the handlers share.
#[derive(Debug)]
pub struct AppState<C> {
    /// Protocol handler and channel ledger.
    pub merchant: Merchant<C>,
    /// Source of `/data` responses.
    pub resource: Resource,
}

/// Shared application state for the merchant service.
pub type MerchantState<C> = Arc<AppState<C>>;

/// `POST /negotiate` — Accepts proposed channel terms.
///
/// # Errors
///
/// Returns 400 on a malformed body or a zero amount.
pub async fn post_negotiate<C: ChannelContract>(
    State(state): State<MerchantState<C>>,
    body: Result<Json<NegotiateRequest>, JsonRejection>,
) -> Result<Json<NegotiateResponse>, MerchantError> {
    let Json(request) = body.map_err(|e| {
        MerchantError::invalid_body("payer, contract, token, and amount are required.", e)
    })?;
    Ok(Json(state.merchant.negotiate(&request)?))
}

/// `GET /data` — Serves one unit of the metered resource.
///
/// # Errors
///
/// Returns 400 without an `address` query parameter, 502 if the upstream fails.
pub async fn get_data<C: ChannelContract>(
    State(state): State<MerchantState<C>>,
    query: Result<Query<DataQuery>, QueryRejection>,
) -> Result<Json<Value>, MerchantError> {
    let Query(query) = query?;
    let address = query.address.ok_or(MerchantError::MissingAddress)?;
    Ok(Json(state.resource.fetch(address).await?))
}

/// `POST /payment` — Verifies a disclosed chain value.
///
/// # Errors
///
/// Returns 404 if the payer has no channel, 400 on a rejected disclosure.
pub async fn post_payment<C: ChannelContract>(
    State(state): State<MerchantState<C>>,
    body: Result<Json<PaymentRequest>, JsonRejection>,
) -> Result<Json<PaymentResponse>, MerchantError> {
    let Json(request) = body.map_err(|e| {
        MerchantError::invalid_body("payerAddress, preimage, and tokensUsed are required.", e)
    })?;
    #[cfg(feature = "telemetry")]
    tracing::info!(
        payer = %request.payer_address,
        steps = request.tokens_used,
        "Payment received"
    );
    match state.merchant.accept_payment(&request).await {
        Ok(response) => Ok(Json(response)),
        Err(err) => {
            #[cfg(feature = "telemetry")]
            tracing::warn!(payer = %request.payer_address, error = %err, "Payment rejected");
            Err(err.into())
        }
    }
}

/// `POST /redeem` — Redeems the payer's channel on-chain.
///
/// # Errors
///
/// Returns 404 if the payer has no channel, 400 if nothing was paid, 502 if
/// the redemption transaction fails.
pub async fn post_redeem<C: ChannelContract>(
    State(state): State<MerchantState<C>>,
    body: Result<Json<RedeemRequest>, JsonRejection>,
) -> Result<Json<RedeemResponse>, MerchantError> {
    let Json(request) =
        body.map_err(|e| MerchantError::invalid_body("payerAddress is required.", e))?;
    let redemption = state.merchant.redeem(request.payer_address).await?;
    Ok(Json(RedeemResponse {
        message: "Channel redeemed successfully.".into(),
        tx_hash: redemption.confirmation.tx_hash,
        tokens_used: Some(redemption.settlement.tokens_used),
    }))
}

/// `GET /channels` — Lists open channels.
pub async fn get_channels<C: ChannelContract>(
    State(state): State<MerchantState<C>>,
) -> Json<Vec<Channel>> {
    Json(state.merchant.ledger().snapshot().await)
}

/// `GET /channels/{payer}` — Returns one open channel.
///
/// # Errors
///
/// Returns 404 if the payer has no channel.
pub async fn get_channel<C: ChannelContract>(
    State(state): State<MerchantState<C>>,
    payer: Result<Path<Address>, PathRejection>,
) -> Result<Json<Channel>, MerchantError> {
    let Path(payer) = payer?;
    state
        .merchant
        .ledger()
        .get(payer)
        .await
        .map(Json)
        .ok_or_else(|| ChannelError::ChannelNotFound(payer).into())
}

/// `GET /health` — Liveness probe.
pub async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Creates an Axum [`Router`] with all merchant endpoints.
///
/// Endpoints:
/// - `POST /negotiate` — accept channel terms
/// - `GET /data` — metered resource
/// - `POST /payment` — verify a disclosure
/// - `POST /redeem` — redeem the channel on-chain
/// - `GET /channels`, `GET /channels/{payer}` — ledger inspection
/// - `GET /health` — liveness
pub fn merchant_router<C: ChannelContract + 'static>(state: MerchantState<C>) -> Router {
    Router::new()
        .route(NEGOTIATE_PATH, post(post_negotiate::<C>))
        .route(DATA_PATH, get(get_data::<C>))
        .route(PAYMENT_PATH, post(post_payment::<C>))
        .route(REDEEM_PATH, post(post_redeem::<C>))
        .route(CHANNELS_PATH, get(get_channels::<C>))
        .route(CHANNEL_PATH, get(get_channel::<C>))
        .route(HEALTH_PATH, get(health))
        .with_state(state)
}
