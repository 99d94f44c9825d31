use std::sync::atomic::{AtomicI64, Ordering};

use lazy_config::ConnectorConfig;

use crate::record::Record;

use super::{Filter, FilterError};

// ---------------------------------------------------------------------------
// SampleFilter — pass every Nth record
// ---------------------------------------------------------------------------

/// Drops all but every `SampleRateMod`-th record. Rate 1 (the default)
/// passes everything.
pub struct SampleFilter {
    count: AtomicI64,
    rate: i64,
}

impl SampleFilter {
    pub fn new(config: &ConnectorConfig) -> Self {
        Self {
            count: AtomicI64::new(0),
            rate: config.u64_param("SampleRateMod", 1) as i64,
        }
    }
}

impl Filter for SampleFilter {
    fn handle(&self, _record: &mut Record) -> Result<(), FilterError> {
        let seen = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if seen < self.rate {
            return Err(FilterError::Ignore);
        }
        self.count.store(0, Ordering::Relaxed);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(rate: &str) -> SampleFilter {
        let cfg: ConnectorConfig =
            serde_json::from_str(&format!(r#"{{"Type":"sample","SampleRateMod":"{rate}"}}"#))
                .unwrap();
        SampleFilter::new(&cfg)
    }

    #[test]
    fn rate_one_passes_everything() {
        let f = filter("1");
        let mut rec = Record::new();
        for _ in 0..5 {
            assert!(f.handle(&mut rec).is_ok());
        }
    }

    #[test]
    fn rate_three_passes_every_third() {
        let f = filter("3");
        let mut rec = Record::new();
        let outcomes: Vec<bool> = (0..6).map(|_| f.handle(&mut rec).is_ok()).collect();
        assert_eq!(outcomes, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn bad_rate_defaults_to_one() {
        let f = filter("not-a-number");
        let mut rec = Record::new();
        assert!(f.handle(&mut rec).is_ok());
    }
}
