mod bayes;
mod geoip;
mod iptree;
mod regexp;
mod sample;

use orion_error::StructError;

use lazy_config::ConnectorConfig;

use crate::error::{CoreReason, CoreResult};
use crate::record::Record;

pub use bayes::BayesFilter;
pub use geoip::GeoIpFilter;
pub use iptree::IpTreeFilter;
pub use regexp::RegexpFilter;
pub use sample::SampleFilter;

// ---------------------------------------------------------------------------
// Filter contract
// ---------------------------------------------------------------------------

/// Error returned by [`Filter::handle`].
///
/// `Ignore` drops the record immediately: no later filter sees it and it is
/// not emitted. Any other error truncates the chain for this record, but the
/// record is still emitted as it currently stands.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("ignore")]
    Ignore,
    #[error("{0}")]
    Message(String),
}

impl FilterError {
    pub fn msg(m: impl Into<String>) -> Self {
        FilterError::Message(m.into())
    }
}

/// Per-record enrichment / classification stage.
///
/// Implementations are stateful but self-synchronizing: when a task runs
/// with parallelism > 1, `handle` is invoked concurrently on different
/// records.
pub trait Filter: Send + Sync {
    fn handle(&self, record: &mut Record) -> Result<(), FilterError>;

    /// Release held resources. Called once, after the task's source has
    /// stopped and before the sink shuts down.
    fn cleanup(&self) {}
}

// ---------------------------------------------------------------------------
// Constructor registry
// ---------------------------------------------------------------------------

/// Build a filter from its `Type`-discriminated config map.
pub fn build(config: &ConnectorConfig) -> CoreResult<Box<dyn Filter>> {
    match config.kind.as_str() {
        "regexp" => Ok(Box::new(RegexpFilter::new(config)?)),
        "sample" => Ok(Box::new(SampleFilter::new(config))),
        "bayes" => Ok(Box::new(BayesFilter::new(config)?)),
        "geoip2" => Ok(Box::new(GeoIpFilter::new(config)?)),
        "iptree" => Ok(Box::new(IpTreeFilter::new(config))),
        other => Err(StructError::from(CoreReason::FilterBuild)
            .with_detail(format!("unknown filter type {other:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: &str) -> ConnectorConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn registry_builds_known_types() {
        assert!(build(&config(r#"{"Type":"sample","SampleRateMod":"2"}"#)).is_ok());
        assert!(build(&config(
            r#"{"Type":"regexp","KeyToFilter":"content","LabelName":"x","crit":"^a"}"#
        ))
        .is_ok());
        assert!(build(&config(r#"{"Type":"iptree","KeyToFilter":"from"}"#)).is_ok());
    }

    #[test]
    fn registry_rejects_unknown_type() {
        assert!(build(&config(r#"{"Type":"lstm"}"#)).is_err());
    }
}
