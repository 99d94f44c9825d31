use std::collections::{HashMap, HashSet};

use orion_error::StructError;
use regex::Regex;

use lazy_config::ConnectorConfig;

use crate::error::{CoreReason, CoreResult};
use crate::record::Record;

use super::{Filter, FilterError};

// ---------------------------------------------------------------------------
// BayesFilter — naive Bayes word classifier
// ---------------------------------------------------------------------------

/// Classifies the `KeyToFilter` value against classes seeded from the task
/// config: `Classifiers` names the classes, and each class name keys a
/// comma-separated token list the class is trained on.
///
/// Only a *strict* result (a unique highest-scoring class) stamps
/// `{KeyToFilter}_BayesCheck`; ties leave the record untouched. Empty input
/// drops the record.
pub struct BayesFilter {
    key_to_filter: String,
    word_split: Option<Regex>,
    classes: Vec<ClassModel>,
    vocabulary: usize,
}

struct ClassModel {
    name: String,
    counts: HashMap<String, usize>,
    total: usize,
}

impl BayesFilter {
    pub fn new(config: &ConnectorConfig) -> CoreResult<Self> {
        let word_split = match config.str_param("WordSplitRegexp") {
            Some(pattern) if !pattern.is_empty() => Some(Regex::new(pattern).map_err(|e| {
                StructError::from(CoreReason::FilterBuild)
                    .with_detail(format!("bad WordSplitRegexp: {e}"))
            })?),
            _ => None,
        };

        let mut classes = Vec::new();
        let mut vocabulary = HashSet::new();
        for name in config.string_param("Classifiers", "").split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let mut counts: HashMap<String, usize> = HashMap::new();
            let mut total = 0;
            for token in config.string_param(name, "").split(',') {
                let token = token.trim().to_lowercase();
                if token.is_empty() {
                    continue;
                }
                vocabulary.insert(token.clone());
                *counts.entry(token).or_insert(0) += 1;
                total += 1;
            }
            classes.push(ClassModel {
                name: name.to_string(),
                counts,
                total,
            });
        }
        if classes.len() < 2 {
            return Err(StructError::from(CoreReason::FilterBuild)
                .with_detail("bayes filter needs at least two classes"));
        }

        Ok(Self {
            key_to_filter: config.string_param("KeyToFilter", ""),
            word_split,
            classes,
            vocabulary: vocabulary.len(),
        })
    }

    fn parse_words(&self, message: &str) -> Vec<String> {
        let normalized = match &self.word_split {
            Some(re) => re.replace_all(message, " ").into_owned(),
            None => message.to_string(),
        };
        normalized
            .split(' ')
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect()
    }

    /// Laplace-smoothed log score of `words` under one class.
    fn log_score(&self, class: &ClassModel, words: &[String]) -> f64 {
        let denom = (class.total + self.vocabulary + 1) as f64;
        words
            .iter()
            .map(|w| {
                let count = class.counts.get(w).copied().unwrap_or(0);
                ((count + 1) as f64 / denom).ln()
            })
            .sum()
    }
}

impl Filter for BayesFilter {
    fn handle(&self, record: &mut Record) -> Result<(), FilterError> {
        let Some(value) = record.get(&self.key_to_filter) else {
            return Err(FilterError::msg("bad data format, not a string"));
        };
        let Some(message) = value.as_str() else {
            return Err(FilterError::msg("bad data format, not a string"));
        };
        if message.is_empty() {
            return Err(FilterError::Ignore);
        }

        let words = self.parse_words(message);
        let scores: Vec<f64> = self
            .classes
            .iter()
            .map(|c| self.log_score(c, &words))
            .collect();

        let (likely, best) = scores
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .expect("at least two classes");
        let strict = scores
            .iter()
            .enumerate()
            .all(|(i, s)| i == likely || s < best);

        if strict {
            let check_key = format!("{}_BayesCheck", self.key_to_filter);
            let class = self.classes[likely].name.clone();
            record.insert(check_key, class);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
