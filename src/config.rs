//! Bridge configuration

use serde::{Deserialize, Serialize};

use crate::error::BridgeResult;

/// Boundary node proxied by the wallet
pub const DEFAULT_HOST: &str = "https://mainnet.plugwallet.ooo/";

/// Hosts that serve the main network
pub const IC_MAINNET_URLS: [&str; 3] = ["https://mainnet.dfinity.network", "ic0.app", DEFAULT_HOST];

/// Default approval timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;

/// Default pairing relay
pub const DEFAULT_RELAY_URL: &str = "wss://bridge.plugwallet.ooo";

/// Site identity shown to the user in approval prompts
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainMetadata {
    /// Site origin
    pub url: String,
    /// Site title
    pub name: String,
    /// Icon urls
    #[serde(default)]
    pub icons: Vec<String>,
}

impl DomainMetadata {
    /// Metadata without icons
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        DomainMetadata {
            url: url.into(),
            name: name.into(),
            icons: Vec::new(),
        }
    }

    /// Add an icon url
    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icons.push(icon.into());
        self
    }
}

/// Configuration for a [`Provider`](crate::Provider)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Network host the agent targets
    pub host: String,
    /// Approval timeout in milliseconds; 0 waits forever
    pub timeout_ms: u64,
    /// Canisters to request at connect time
    pub whitelist: Vec<String>,
    /// Requesting site
    pub metadata: DomainMetadata,
    /// Pairing relay for mobile wallets
    pub relay_url: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            host: DEFAULT_HOST.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            whitelist: Vec::new(),
            metadata: DomainMetadata::default(),
            relay_url: DEFAULT_RELAY_URL.to_string(),
        }
    }
}

impl BridgeConfig {
    /// Parse a JSON document; missing fields take defaults
    pub fn from_json(json: &str) -> BridgeResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Whether the host serves the main network
    pub fn is_mainnet_host(&self) -> bool {
        is_mainnet_host(&self.host)
    }
}

/// Whether a host serves the main network
pub fn is_mainnet_host(host: &str) -> bool {
    IC_MAINNET_URLS.contains(&host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config =
            BridgeConfig::from_json(r#"{"whitelist":["aaaaa-aa"],"metadata":{"url":"https://a","name":"A"}}"#)
                .unwrap();

        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.whitelist, vec!["aaaaa-aa"]);
        assert!(config.metadata.icons.is_empty());
        assert_eq!(config.relay_url, DEFAULT_RELAY_URL);
        assert!(config.is_mainnet_host());
    }

    #[test]
    fn test_local_host_is_not_mainnet() {
        let config = BridgeConfig::from_json(r#"{"host":"http://localhost:8000"}"#).unwrap();
        assert!(!config.is_mainnet_host());
        assert!(is_mainnet_host("ic0.app"));
    }

    #[test]
    fn test_invalid_json_is_encoding_error() {
        let err = BridgeConfig::from_json("{").unwrap_err();
        assert!(matches!(err, crate::BridgeError::Encoding { .. }));
    }
}
