use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use orion_error::compat_prelude::*;
use orion_error::prelude::*;
use serde::Deserialize;

use crate::error::{RuntimeReason, RuntimeResult};

// ---------------------------------------------------------------------------
// ConsulClient — desired-state reads from the KV store
// ---------------------------------------------------------------------------

/// Minimal Consul KV client: one recursive list call per reconcile tick.
pub struct ConsulClient {
    http: reqwest::Client,
    base: String,
    datacenter: String,
    token: String,
}

#[derive(Deserialize)]
struct KvPair {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

impl ConsulClient {
    pub fn new(address: &str, datacenter: &str, token: &str) -> RuntimeResult<Self> {
        let base = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .owe(RuntimeReason::Bootstrap)?;
        Ok(Self {
            http,
            base,
            datacenter: datacenter.to_string(),
            token: token.to_string(),
        })
    }

    /// Recursively list `prefix`, returning entries keyed by the path
    /// remainder after `{prefix}/`. A missing prefix is an empty map, not an
    /// error.
    pub async fn kv_list(&self, prefix: &str) -> RuntimeResult<HashMap<String, String>> {
        let url = format!("{}/v1/kv/{}", self.base, prefix);
        let mut request = self.http.get(&url).query(&[("recurse", "true")]);
        if !self.datacenter.is_empty() {
            request = request.query(&[("dc", self.datacenter.as_str())]);
        }
        if !self.token.is_empty() {
            request = request.header("X-Consul-Token", &self.token);
        }

        let response = request.send().await.owe_sys()?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(HashMap::new());
        }
        let pairs: Vec<KvPair> = response
            .error_for_status()
            .owe_sys()?
            .json()
            .await
            .owe_sys()?;

        let skip = prefix.len() + 1;
        let mut entries = HashMap::new();
        for pair in pairs {
            if pair.key.len() <= skip {
                continue;
            }
            let Some(encoded) = pair.value else { continue };
            match BASE64.decode(&encoded) {
                Ok(raw) => {
                    entries.insert(
                        pair.key[skip..].to_string(),
                        String::from_utf8_lossy(&raw).into_owned(),
                    );
                }
                Err(e) => lz_warn!(conf, key = %pair.key, error = %e, "undecodable KV value"),
            }
        }
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
