use std::collections::HashMap;

use orion_error::StructError;
use regex::Regex;

use lazy_config::ConnectorConfig;

use crate::error::{CoreReason, CoreResult};
use crate::record::{Record, Value};

use super::{Filter, FilterError};

// ---------------------------------------------------------------------------
// RegexpFilter — label or drop records by pattern match
// ---------------------------------------------------------------------------

/// Matches `KeyToFilter` against a pattern selected by the record's
/// `HashKey` value (`"default"` when the key is absent).
///
/// Every config key besides the reserved ones is a `hash-value → pattern`
/// pair. A match either drops the record (`LabelName == "ignore"`) or stamps
/// `{HashKey}_{KeyToFilter}_RegexpCheck` with the label.
pub struct RegexpFilter {
    hash_key: String,
    key_to_filter: String,
    label_name: String,
    patterns: HashMap<String, Regex>,
}

impl RegexpFilter {
    pub fn new(config: &ConnectorConfig) -> CoreResult<Self> {
        let mut patterns = HashMap::new();
        for (key, pattern) in config.extra_params(&["KeyToFilter", "HashKey", "LabelName"]) {
            match Regex::new(&pattern) {
                Ok(re) => {
                    patterns.insert(key, re);
                }
                Err(e) => log::warn!("regexp filter: dropping pattern {key}={pattern:?}: {e}"),
            }
        }
        if patterns.is_empty() {
            return Err(StructError::from(CoreReason::FilterBuild).with_detail("null regexp"));
        }
        Ok(Self {
            hash_key: config.string_param("HashKey", ""),
            key_to_filter: config.string_param("KeyToFilter", ""),
            label_name: config.string_param("LabelName", ""),
            patterns,
        })
    }
}

impl Filter for RegexpFilter {
    fn handle(&self, record: &mut Record) -> Result<(), FilterError> {
        let Some(message) = record.get(&self.key_to_filter) else {
            return Ok(());
        };
        let Some(message) = message.as_str() else {
            return Err(FilterError::msg("bad data format, not a string"));
        };

        let hash_value = match record.get(&self.hash_key) {
            Some(Value::Str(s)) => s.as_str(),
            Some(_) => return Ok(()),
            None => "default",
        };

        if let Some(re) = self.patterns.get(hash_value)
            && re.is_match(message)
        {
            if self.label_name == "ignore" {
                return Err(FilterError::Ignore);
            }
            let check_key = format!("{}_{}_RegexpCheck", self.hash_key, self.key_to_filter);
            let label = self.label_name.clone();
            record.insert(check_key, label);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
