//! Node configuration from the environment.
//!
//! The node reads `DATA_DIR`, `HTTP_ADDRESS`, `AES_KEY` (base64, 32
//! bytes) and `GENESIS_ACCOUNT` as required variables, plus the optional
//! `GRPC_ADDRESS`, `PEERS` (comma-separated) and `TESTNET`. A missing
//! required variable is a startup failure; the caller exits non-zero.

use base64::Engine;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::types::Address;
use crate::ChainConfig;

/// Node configuration.
#[derive(Clone)]
pub struct NodeConfig {
    /// Directory for the persistent store
    pub data_dir: PathBuf,
    /// HTTP RPC listen address
    pub http_address: SocketAddr,
    /// gRPC listen address, when a gRPC adapter fronts this node
    pub grpc_address: Option<SocketAddr>,
    /// Known peer addresses
    pub peers: Vec<String>,
    /// 32-byte symmetric key for payload and at-rest encryption
    pub aes_key: [u8; 32],
    /// Account credited with the genesis supply
    pub genesis_account: Address,
    /// Run with testnet chain parameters
    pub testnet: bool,
}

impl NodeConfig {
    /// Load the configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = PathBuf::from(required("DATA_DIR")?);

        let http_raw = required("HTTP_ADDRESS")?;
        let http_address = http_raw.parse().map_err(|_| ConfigError::Invalid {
            var: "HTTP_ADDRESS".into(),
            reason: format!("not a socket address: {http_raw}"),
        })?;

        let grpc_address = match std::env::var("GRPC_ADDRESS") {
            Ok(raw) if !raw.trim().is_empty() => {
                Some(raw.parse().map_err(|_| ConfigError::Invalid {
                    var: "GRPC_ADDRESS".into(),
                    reason: format!("not a socket address: {raw}"),
                })?)
            }
            _ => None,
        };

        let peers = std::env::var("PEERS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();

        let key_b64 = required("AES_KEY")?;
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(key_b64.trim())
            .map_err(|_| ConfigError::Invalid {
                var: "AES_KEY".into(),
                reason: "not valid base64".into(),
            })?;
        let aes_key: [u8; 32] = key_bytes.try_into().map_err(|_| ConfigError::Invalid {
            var: "AES_KEY".into(),
            reason: "decoded key must be exactly 32 bytes".into(),
        })?;

        let genesis_raw = required("GENESIS_ACCOUNT")?;
        let genesis_account = Address::parse(&genesis_raw).map_err(|e| ConfigError::Invalid {
            var: "GENESIS_ACCOUNT".into(),
            reason: e.to_string(),
        })?;

        let testnet = std::env::var("TESTNET")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            data_dir,
            http_address,
            grpc_address,
            peers,
            aes_key,
            genesis_account,
            testnet,
        })
    }

    /// Chain parameters for the configured network.
    pub fn chain_config(&self) -> ChainConfig {
        if self.testnet {
            ChainConfig::testnet()
        } else {
            ChainConfig::default()
        }
    }
}

impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The AES key is deliberately absent: keys are never logged.
        f.debug_struct("NodeConfig")
            .field("data_dir", &self.data_dir)
            .field("http_address", &self.http_address)
            .field("grpc_address", &self.grpc_address)
            .field("peers", &self.peers)
            .field("genesis_account", &self.genesis_account)
            .field("testnet", &self.testnet)
            .finish()
    }
}

fn required(var: &str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVar(var.to_string())),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },
}
