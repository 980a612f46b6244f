//! HTTP-specific constants shared by the merchant service and its clients.

use std::time::Duration;

/// Channel negotiation route.
pub const NEGOTIATE_PATH: &str = "/negotiate";

/// Metered resource route.
pub const DATA_PATH: &str = "/data";

/// Payment disclosure route.
pub const PAYMENT_PATH: &str = "/payment";

/// Settlement route.
pub const REDEEM_PATH: &str = "/redeem";

/// Open channel listing route.
pub const CHANNELS_PATH: &str = "/channels";

/// Channel inspection route; `{payer}` is the payer address.
pub const CHANNEL_PATH: &str = "/channels/{payer}";

/// Liveness route.
pub const HEALTH_PATH: &str = "/health";

/// Default merchant agent URL.
pub const DEFAULT_MERCHANT_URL: &str = "http://localhost:3001";

/// Default timeout for `POST /negotiate`.
pub const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for `GET /data`.
pub const DATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for `POST /payment`.
pub const PAYMENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for `POST /redeem`. Covers the merchant's on-chain wait.
pub const REDEEM_TIMEOUT: Duration = Duration::from_secs(10);
