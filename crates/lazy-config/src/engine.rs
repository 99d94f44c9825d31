use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::logging::LoggingConfig;

// ---------------------------------------------------------------------------
// EngineConfig — the lazy.json process configuration
// ---------------------------------------------------------------------------

/// Top-level engine configuration, read from the `-c` file (default
/// `lazy.json`).
///
/// Task definitions do not live here: they are pulled from the Consul KV
/// store under `{ConsulKey}/tasks/` by the reconcile loop.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EngineConfig {
    /// Consul agent address, e.g. `"127.0.0.1:8500"` or a full URL.
    pub consul_address: String,
    #[serde(default)]
    pub datacenter: String,
    #[serde(default)]
    pub consul_token: String,
    /// KV namespace for this engine's task entries.
    pub consul_key: String,
    /// Listen address for the `/metrics` endpoint.
    #[serde(default = "default_metric_addr")]
    pub metric_addr: String,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_metric_addr() -> String {
    "0.0.0.0:7080".to_string()
}

impl EngineConfig {
    /// Read and parse the engine config file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.as_ref().display()))?;
        content.parse()
    }
}

impl FromStr for EngineConfig {
    type Err = anyhow::Error;

    fn from_str(json: &str) -> anyhow::Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        if config.consul_address.is_empty() {
            anyhow::bail!("ConsulAddress must not be empty");
        }
        if config.consul_key.is_empty() {
            anyhow::bail!("ConsulKey must not be empty");
        }
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogFormat;

    const FULL_JSON: &str = r#"
{
  "ConsulAddress": "127.0.0.1:8500",
  "Datacenter": "dc1",
  "ConsulToken": "secret",
  "ConsulKey": "lazy/cluster1",
  "MetricAddr": "0.0.0.0:9080",
  "Logging": {"level": "debug", "format": "json"}
}
"#;

    #[test]
    fn load_full_json() {
        let cfg: EngineConfig = FULL_JSON.parse().unwrap();
        assert_eq!(cfg.consul_address, "127.0.0.1:8500");
        assert_eq!(cfg.datacenter, "dc1");
        assert_eq!(cfg.consul_token, "secret");
        assert_eq!(cfg.consul_key, "lazy/cluster1");
        assert_eq!(cfg.metric_addr, "0.0.0.0:9080");
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn metric_addr_defaults() {
        let cfg: EngineConfig =
            r#"{"ConsulAddress": "127.0.0.1:8500", "ConsulKey": "lazy"}"#.parse().unwrap();
        assert_eq!(cfg.metric_addr, "0.0.0.0:7080");
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn reject_missing_consul_key() {
        assert!(r#"{"ConsulAddress": "127.0.0.1:8500"}"#.parse::<EngineConfig>().is_err());
    }

    #[test]
    fn reject_empty_consul_address() {
        assert!(
            r#"{"ConsulAddress": "", "ConsulKey": "lazy"}"#.parse::<EngineConfig>().is_err()
        );
    }

    #[test]
    fn reject_malformed_json() {
        assert!("not json".parse::<EngineConfig>().is_err());
    }
}
