use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// TaskConfig — one pipeline definition, as stored in the KV store
// ---------------------------------------------------------------------------

/// A single task definition: one input, one output, a parser, and an ordered
/// filter chain. The task name is the KV key, not part of the JSON body.
///
/// Reconfiguration is stop + start with a new config; instances never mutate
/// their `TaskConfig` after construction.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    #[serde(rename = "Input")]
    pub input: ConnectorConfig,
    #[serde(rename = "Output")]
    pub output: ConnectorConfig,
    #[serde(rename = "LogParser", default)]
    pub log_parser: ParserConfig,
    #[serde(rename = "FilterOrder", default)]
    pub filter_order: Vec<String>,
    #[serde(rename = "FilterSettings", default)]
    pub filter_settings: HashMap<String, ConnectorConfig>,
}

impl TaskConfig {
    /// Parse a raw KV value. Any JSON that deserializes and names both a
    /// source and a sink type is considered well-formed; whether the engine
    /// can actually construct the components is decided at build time.
    pub fn parse(config: &[u8]) -> anyhow::Result<Self> {
        let task: TaskConfig =
            serde_json::from_slice(config).map_err(|e| anyhow::anyhow!("bad task config: {e}"))?;
        if task.input.kind.is_empty() {
            anyhow::bail!("bad task config: Input.Type is missing");
        }
        if task.output.kind.is_empty() {
            anyhow::bail!("bad task config: Output.Type is missing");
        }
        Ok(task)
    }

    /// Cheap validity probe used by the reconcile loop before it decides to
    /// replace a running task.
    pub fn is_valid(config: &[u8]) -> bool {
        Self::parse(config).is_ok()
    }
}

// ---------------------------------------------------------------------------
// ConnectorConfig — a Type-discriminated parameter map
// ---------------------------------------------------------------------------

/// Config map for a source, sink, or filter, discriminated by `Type`.
///
/// The legacy wire format carries every parameter as a JSON string
/// (`"MaxInFlight": "100"`, `"ReadAll": "true"`), so the typed accessors
/// below coerce from strings as well as native JSON numbers and booleans.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectorConfig {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(flatten)]
    pub params: serde_json::Map<String, Value>,
}

impl ConnectorConfig {
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn string_param(&self, key: &str, default: &str) -> String {
        self.str_param(key).unwrap_or(default).to_string()
    }

    pub fn bool_param(&self, key: &str) -> bool {
        match self.params.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "true",
            _ => false,
        }
    }

    pub fn u64_param(&self, key: &str, default: u64) -> u64 {
        match self.params.get(key) {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(default),
            Some(Value::String(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn usize_param(&self, key: &str, default: usize) -> usize {
        self.u64_param(key, default as u64) as usize
    }

    /// Parameters other than the well-known ones, as strings. Used by
    /// filters whose remaining keys are free-form (e.g. regexp label →
    /// pattern pairs).
    pub fn extra_params(&self, reserved: &[&str]) -> Vec<(String, String)> {
        self.params
            .iter()
            .filter(|(k, _)| !reserved.contains(&k.as_str()))
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// ParserConfig
// ---------------------------------------------------------------------------

/// Parser selection and token rules. An absent or unknown `LogType` falls
/// through to the `raw` parser.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParserConfig {
    #[serde(rename = "LogType", default)]
    pub log_type: String,
    #[serde(rename = "Timezone", default)]
    pub timezone: String,
    #[serde(rename = "Tokens", default)]
    pub tokens: Vec<String>,
    #[serde(rename = "TokenFormat", default)]
    pub token_format: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
