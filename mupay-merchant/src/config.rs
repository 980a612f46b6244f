//! Merchant server configuration.
//!
//! Loads configuration from a TOML file with support for environment variable
//! expansion in string values. Variables use `$VAR` or `${VAR}` syntax.
//!
//! # Example Configuration
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 3001
//!
//! [chain]
//! rpc_url = "$RPC_URL"
//! contract_address = "$MUPAY_CONTRACT_ADDRESS"
//! signer_private_key = "$MERCHANT_PRIVATE_KEY"
//! confirmations = 1
//! receipt_timeout_secs = 30
//!
//! [watcher]
//! poll_interval_ms = 2000
//!
//! [ledger]
//! step_policy = "allow-skips"
//!
//! [resource]
//! upstream_url = "https://api.1inch.dev/portfolio/portfolio/v5.0/general/current_value"
//! api_key = "$ONEINCH_API_KEY"
//! address_param = "addresses"
//! query = { chain_id = "1", use_cache = "true" }
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` — Path to configuration file (default: `merchant.toml`)
//! - `HOST` — Override server bind address
//! - `PORT` — Override server port
//! - Secrets referenced by `$VAR` in the config file

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use alloy_primitives::Address;
use mupay::{ChannelError, StepPolicy};
use serde::{Deserialize, Serialize};
use url::Url;

/// Top-level merchant configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerchantConfig {
    /// Server bind address (default: `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Server port (default: `3001`).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Escrow chain connection.
    pub chain: ChainConfig,

    /// `ChannelCreated` log polling.
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Channel ledger behavior.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// The metered resource served on `/data`.
    #[serde(default)]
    pub resource: ResourceConfig,
}

/// Connection to the escrow contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// HTTP RPC endpoint URL.
    pub rpc_url: String,

    /// Address of the escrow contract.
    pub contract_address: String,

    /// Private key for the merchant signer (hex, with or without `0x` prefix).
    /// Supports `$VAR` / `${VAR}` for environment variable expansion.
    pub signer_private_key: String,

    /// Confirmations to wait for on redemption.
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,

    /// Upper bound on the wait for a receipt, in seconds.
    #[serde(default = "default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,
}

/// Log polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Delay between polls, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// First block to scan; the chain head when unset.
    #[serde(default)]
    pub start_block: Option<u64>,
}

/// Channel ledger settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// `allow-skips` (default) or `single-step`.
    #[serde(default)]
    pub step_policy: StepPolicy,
}

/// The resource served on `/data`.
///
/// Without an upstream, `/data` answers with a small local payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Upstream API proxied by `/data`.
    #[serde(default)]
    pub upstream_url: Option<String>,

    /// Bearer token sent to the upstream.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Name of the query parameter carrying the requested address.
    #[serde(default = "default_address_param")]
    pub address_param: String,

    /// Extra static query parameters sent to the upstream.
    #[serde(default)]
    pub query: HashMap<String, String>,

    /// Upstream request timeout, in seconds.
    #[serde(default = "default_resource_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            start_block: None,
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            upstream_url: None,
            api_key: None,
            address_param: default_address_param(),
            query: HashMap::new(),
            timeout_secs: default_resource_timeout_secs(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0))
}

const fn default_port() -> u16 {
    3001
}

const fn default_confirmations() -> u64 {
    1
}

const fn default_receipt_timeout_secs() -> u64 {
    30
}

const fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_address_param() -> String {
    "address".to_owned()
}

const fn default_resource_timeout_secs() -> u64 {
    10
}

impl MerchantConfig {
    /// Loads configuration from the path given by the `CONFIG` environment
    /// variable, falling back to `merchant.toml` in the current directory.
    ///
    /// After loading, all string values with `$VAR` / `${VAR}` references
    /// are expanded from the process environment. `HOST` and `PORT` env vars
    /// override the file values.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let path = std::env::var("CONFIG").unwrap_or_else(|_| "merchant.toml".to_owned());
        Self::load_from(&path)
    }

    /// Loads configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = if Path::new(path).exists() {
            std::fs::read_to_string(path)?
        } else {
            // If no config file exists, use empty TOML; `[chain]` is then reported missing
            String::new()
        };

        let mut config = Self::from_toml(&content)?;

        // Allow HOST / PORT env overrides
        if let Ok(host) = std::env::var("HOST") {
            if let Ok(addr) = host.parse() {
                config.host = addr;
            }
        }
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(p) = port.parse() {
                config.port = p;
            }
        }

        Ok(config)
    }

    /// Parses configuration from TOML text, expanding environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid configuration.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(&expand_env_vars(content))
    }

    /// The escrow contract address.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidConfiguration`] if it is not an address.
    pub fn contract_address(&self) -> Result<Address, ChannelError> {
        self.chain.contract_address.trim().parse().map_err(|e| {
            ChannelError::InvalidConfiguration(format!(
                "invalid contract_address {:?}: {e}",
                self.chain.contract_address
            ))
        })
    }

    /// The RPC endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidConfiguration`] if it is not a URL.
    pub fn rpc_url(&self) -> Result<Url, ChannelError> {
        self.chain.rpc_url.trim().parse().map_err(|e| {
            ChannelError::InvalidConfiguration(format!(
                "invalid rpc_url {:?}: {e}",
                self.chain.rpc_url
            ))
        })
    }

    /// The merchant signer's private key, with surrounding whitespace removed.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidConfiguration`] if the key is empty or
    /// still refers to an unset environment variable.
    pub fn signer_private_key(&self) -> Result<&str, ChannelError> {
        let key = self.chain.signer_private_key.trim();
        if key.is_empty() || key.starts_with('$') {
            return Err(ChannelError::InvalidConfiguration(
                "signer_private_key not resolved (missing env var?)".into(),
            ));
        }
        Ok(key)
    }

    /// Receipt wait bound for escrow transactions.
    pub const fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.chain.receipt_timeout_secs)
    }

    /// Delay between log polls.
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.watcher.poll_interval_ms)
    }

    /// Checks every value that is only used after startup.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidConfiguration`] for the first bad value.
    pub fn validate(&self) -> Result<(), ChannelError> {
        self.contract_address()?;
        self.rpc_url()?;
        self.signer_private_key()?;
        if self.chain.confirmations == 0 {
            return Err(ChannelError::InvalidConfiguration(
                "confirmations must be at least 1".into(),
            ));
        }
        if self.chain.receipt_timeout_secs == 0 {
            return Err(ChannelError::InvalidConfiguration(
                "receipt_timeout_secs must be positive".into(),
            ));
        }
        if self.watcher.poll_interval_ms == 0 {
            return Err(ChannelError::InvalidConfiguration(
                "poll_interval_ms must be positive".into(),
            ));
        }
        if let Some(upstream) = &self.resource.upstream_url {
            upstream.parse::<Url>().map_err(|e| {
                ChannelError::InvalidConfiguration(format!("invalid upstream_url {upstream:?}: {e}"))
            })?;
        }
        Ok(())
    }
}

/// Expands `$VAR` and `${VAR}` patterns in a string from environment variables.
///
/// Unresolved variables are left as-is.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }
        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next(); // consume '{'
        }

        let mut var_name = String::new();
        while let Some(&c) = chars.peek() {
            if braced {
                if c == '}' {
                    chars.next();
                    break;
                }
            } else if !c.is_ascii_alphanumeric() && c != '_' {
                break;
            }
            var_name.push(c);
            chars.next();
        }

        match std::env::var(&var_name) {
            Ok(val) if !var_name.is_empty() => result.push_str(&val),
            _ => {
                result.push('$');
                if braced {
                    result.push('{');
                }
                result.push_str(&var_name);
                if braced && !var_name.is_empty() {
                    result.push('}');
                }
            }
        }
    }

    result
}
