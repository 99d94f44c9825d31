use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::IpNet;

use lazy_config::ConnectorConfig;

use crate::record::{Record, Value};

use super::{Filter, FilterError};

// ---------------------------------------------------------------------------
// IpTreeFilter — longest-prefix CIDR annotation
// ---------------------------------------------------------------------------

/// Annotates records with `BackendEnv` by longest-prefix match of the
/// `KeyToFilter` address (host part before any `:`) against a CIDR→label
/// map loaded from the `File` parameter (JSON object).
///
/// An unreadable or malformed file leaves the tree empty; the filter still
/// constructs and passes records through unannotated.
pub struct IpTreeFilter {
    key_to_filter: String,
    networks: Vec<(IpNet, String)>,
}

impl IpTreeFilter {
    pub fn new(config: &ConnectorConfig) -> Self {
        let path = config.string_param("File", "");
        let networks = match load_networks(&path) {
            Ok(networks) => networks,
            Err(e) => {
                log::warn!("iptree filter: {path:?}: {e}, starting with empty tree");
                Vec::new()
            }
        };
        Self {
            key_to_filter: config.string_param("KeyToFilter", ""),
            networks,
        }
    }

    fn lookup(&self, addr: IpAddr) -> Option<&str> {
        self.networks
            .iter()
            .filter(|(net, _)| net.contains(&addr))
            .max_by_key(|(net, _)| net.prefix_len())
            .map(|(_, label)| label.as_str())
    }
}

fn load_networks(path: &str) -> anyhow::Result<Vec<(IpNet, String)>> {
    let body = std::fs::read(path)?;
    let entries: HashMap<String, String> = serde_json::from_slice(&body)?;
    let mut networks = Vec::with_capacity(entries.len());
    for (cidr, label) in entries {
        let net = parse_net(&cidr)?;
        networks.push((net, label));
    }
    Ok(networks)
}

/// Accepts both CIDR notation and bare addresses (treated as host routes).
fn parse_net(s: &str) -> anyhow::Result<IpNet> {
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net);
    }
    let addr: IpAddr = s.parse()?;
    Ok(IpNet::from(addr))
}

impl Filter for IpTreeFilter {
    fn handle(&self, record: &mut Record) -> Result<(), FilterError> {
        let Some(info) = record.get(&self.key_to_filter).and_then(Value::as_str) else {
            return Err(FilterError::msg("bad data format, not a string"));
        };
        let host = info.split(':').next().unwrap_or("");
        let Ok(addr) = host.parse::<IpAddr>() else {
            return Ok(());
        };
        if let Some(label) = self.lookup(addr) {
            let label = label.to_string();
            record.insert("BackendEnv", label);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn filter_with(db: &str) -> IpTreeFilter {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(db.as_bytes()).unwrap();
        let cfg: ConnectorConfig = serde_json::from_str(&format!(
            r#"{{"Type":"iptree","KeyToFilter":"from","File":"{}"}}"#,
            file.path().display()
        ))
        .unwrap();
        let filter = IpTreeFilter::new(&cfg);
        // NamedTempFile is read during construction; safe to drop now.
        drop(file);
        filter
    }

    fn record(from: &str) -> Record {
        let mut rec = Record::new();
        rec.insert("from", from);
        rec
    }

    #[test]
    fn longest_prefix_wins() {
        let f = filter_with(r#"{"10.0.0.0/8": "prod", "10.1.0.0/16": "staging"}"#);
        let mut rec = record("10.1.2.3");
        f.handle(&mut rec).unwrap();
        assert_eq!(rec.get_str("BackendEnv"), Some("staging"));

        let mut rec = record("10.9.9.9");
        f.handle(&mut rec).unwrap();
        assert_eq!(rec.get_str("BackendEnv"), Some("prod"));
    }

    #[test]
    fn port_suffix_is_stripped() {
        let f = filter_with(r#"{"192.168.0.0/24": "lan"}"#);
        let mut rec = record("192.168.0.7:8080");
        f.handle(&mut rec).unwrap();
        assert_eq!(rec.get_str("BackendEnv"), Some("lan"));
    }

    #[test]
    fn unmatched_address_passes_through() {
        let f = filter_with(r#"{"10.0.0.0/8": "prod"}"#);
        let mut rec = record("172.16.0.1");
        f.handle(&mut rec).unwrap();
        assert!(!rec.contains_key("BackendEnv"));
    }

    #[test]
    fn bare_address_entry_is_host_route() {
        let f = filter_with(r#"{"10.0.0.5": "pinned"}"#);
        let mut rec = record("10.0.0.5");
        f.handle(&mut rec).unwrap();
        assert_eq!(rec.get_str("BackendEnv"), Some("pinned"));
    }

    #[test]
    fn missing_file_yields_empty_tree() {
        let cfg: ConnectorConfig = serde_json::from_str(
            r#"{"Type":"iptree","KeyToFilter":"from","File":"/nonexistent.json"}"#,
        )
        .unwrap();
        let f = IpTreeFilter::new(&cfg);
        let mut rec = record("10.0.0.1");
        f.handle(&mut rec).unwrap();
        assert!(!rec.contains_key("BackendEnv"));
    }

    #[test]
    fn non_ip_value_passes_through() {
        let f = filter_with(r#"{"10.0.0.0/8": "prod"}"#);
        let mut rec = record("not-an-ip");
        assert!(f.handle(&mut rec).is_ok());
    }
}
