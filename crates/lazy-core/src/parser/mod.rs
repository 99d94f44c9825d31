mod rfc3164;
mod tokenize;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use orion_error::StructError;

use lazy_config::ParserConfig;

use crate::error::{CoreReason, CoreResult};
use crate::record::{RawRecord, Record, Value};

pub use tokenize::tokenize;

// ---------------------------------------------------------------------------
// LogParser — raw bytes → structured record
// ---------------------------------------------------------------------------

/// Parser variant, selected by the task config's `LogType` discriminator.
/// Unknown or absent types fall through to [`LogParser::Raw`], which is a
/// total function over any input.
#[derive(Debug, Clone)]
pub enum LogParser {
    Rfc3164 {
        timezone: Option<Tz>,
    },
    CustomSchema {
        tokens: Vec<String>,
        token_format: HashMap<String, String>,
    },
    KeyValue,
    Raw,
}

impl LogParser {
    pub fn from_config(config: &ParserConfig) -> Self {
        match config.log_type.as_str() {
            "rfc3164" => {
                let timezone = match config.timezone.parse::<Tz>() {
                    Ok(tz) => Some(tz),
                    Err(_) => {
                        if !config.timezone.is_empty() {
                            log::warn!("unknown timezone {:?}, using UTC", config.timezone);
                        }
                        None
                    }
                };
                LogParser::Rfc3164 { timezone }
            }
            "customschema" => LogParser::CustomSchema {
                tokens: config.tokens.clone(),
                token_format: config.token_format.clone(),
            },
            "keyvalue" => LogParser::KeyValue,
            _ => LogParser::Raw,
        }
    }

    pub fn parse(&self, raw: &RawRecord) -> CoreResult<Record> {
        match self {
            LogParser::Rfc3164 { timezone } => Ok(parse_rfc3164(raw, *timezone)),
            LogParser::CustomSchema {
                tokens,
                token_format,
            } => parse_custom_schema(&raw.msg, tokens, token_format),
            LogParser::KeyValue => parse_key_value(&raw.msg),
            LogParser::Raw => {
                let mut record = Record::new();
                record.insert("rawmsg", String::from_utf8_lossy(&raw.msg).into_owned());
                record.insert("timestamp", Utc::now());
                Ok(record)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// rfc3164
// ---------------------------------------------------------------------------

/// Syslog parse failures do not drop the record: the payload is kept under
/// `content` with the current time, mirroring the forgiving upstream path.
fn parse_rfc3164(raw: &RawRecord, timezone: Option<Tz>) -> Record {
    let mut record = Record::new();
    match rfc3164::parse(&raw.msg, timezone) {
        Ok(msg) => {
            record.insert("priority", msg.priority as i64);
            record.insert("facility", msg.facility as i64);
            record.insert("severity", msg.severity as i64);
            record.insert("timestamp", msg.timestamp);
            record.insert("hostname", msg.hostname);
            record.insert("content", msg.content);
            record.insert("tag", normalize_tag(&msg.tag));
        }
        Err(_) => {
            record.insert("content", String::from_utf8_lossy(&raw.msg).into_owned());
            record.insert("timestamp", Utc::now());
            return record;
        }
    }
    if let Some(from) = &raw.from {
        record.insert("from", String::from_utf8_lossy(from).into_owned());
    }
    record
}

/// Strip dots, keep the final path segment, trim dashes; `"misc"` when
/// nothing remains.
fn normalize_tag(tag: &str) -> String {
    let tag = tag.replace('.', "");
    let tag = tag.rsplit('/').next().unwrap_or("");
    let tag = if tag.is_empty() { "misc" } else { tag };
    tag.trim_matches('-').to_string()
}

// ---------------------------------------------------------------------------
// customschema
// ---------------------------------------------------------------------------

const NGINX_TIME_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

fn parse_custom_schema(
    msg: &[u8],
    tokens: &[String],
    token_format: &HashMap<String, String>,
) -> CoreResult<Record> {
    let msg_tokens = tokenize(msg);
    if tokens.len() != msg_tokens.len() {
        return Err(StructError::from(CoreReason::Parse).with_detail(format!(
            "log format error: expected {} tokens, got {}",
            tokens.len(),
            msg_tokens.len()
        )));
    }

    let mut record = Record::new();
    for (token, tk) in tokens.iter().zip(&msg_tokens) {
        let Some(format) = token_format.get(token) else {
            continue;
        };
        match format.as_str() {
            "int" => {
                let n: i64 = tk.parse().map_err(|_| {
                    StructError::from(CoreReason::DataFormat)
                        .with_detail(format!("data format err: {tk:?} int"))
                })?;
                record.insert(token.clone(), n);
            }
            "float" => {
                let f: f64 = tk.parse().map_err(|_| {
                    StructError::from(CoreReason::DataFormat)
                        .with_detail(format!("data format err: {tk:?} float"))
                })?;
                record.insert(token.clone(), f);
            }
            "strings" => {
                let keys: Vec<&str> = token.split(' ').collect();
                let mut values: Vec<&str> = tk.split(' ').collect();
                if keys.len() != values.len() {
                    values.retain(|v| !v.is_empty());
                    if keys.len() != values.len() {
                        return Err(StructError::from(CoreReason::Parse).with_detail(format!(
                            "log format error: {keys:?} {values:?}"
                        )));
                    }
                }
                for (k, v) in keys.iter().zip(&values) {
                    record.insert(k.to_string(), v.to_string());
                }
            }
            "nginxtimestamp" => {
                let t = DateTime::parse_from_str(tk, NGINX_TIME_FORMAT).map_err(|_| {
                    StructError::from(CoreReason::DataFormat)
                        .with_detail(format!("data format err: {tk:?} nginxtimestamp"))
                })?;
                record.insert(token.clone(), t.with_timezone(&Utc));
            }
            _ => {
                record.insert(token.clone(), tk.clone());
            }
        }
    }
    if !record.contains_key("timestamp") {
        record.insert("timestamp", Utc::now());
    }
    Ok(record)
}

// ---------------------------------------------------------------------------
// keyvalue
// ---------------------------------------------------------------------------

/// A flat JSON object of string→string pairs. An inbound `timestamp` is
/// preserved under `RawTimestamp`; `timestamp` itself is always the engine's
/// receive time.
fn parse_key_value(msg: &[u8]) -> CoreResult<Record> {
    let kv: HashMap<String, String> = serde_json::from_slice(msg).map_err(|e| {
        StructError::from(CoreReason::Parse).with_detail(format!("keyvalue parse: {e}"))
    })?;
    let mut record = Record::new();
    for (k, v) in kv {
        if k == "timestamp" {
            record.insert("RawTimestamp", v.clone());
        }
        record.insert(k, v);
    }
    record.insert("timestamp", Utc::now());
    Ok(record)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parser(log_type: &str) -> LogParser {
        LogParser::from_config(&ParserConfig {
            log_type: log_type.to_string(),
            ..Default::default()
        })
    }

    // -- raw --

    #[test]
    fn raw_is_total() {
        let parser = parser("raw");
        for payload in [&b"anything"[..], b"", b"\xff\xfe"] {
            let rec = parser.parse(&RawRecord::new(payload.to_vec())).unwrap();
            assert!(rec.contains_key("rawmsg"));
            assert!(rec.contains_key("timestamp"));
        }
    }

    #[test]
    fn unknown_log_type_falls_back_to_raw() {
        let rec = parser("surprise")
            .parse(&RawRecord::new(b"x".to_vec()))
            .unwrap();
        assert_eq!(rec.get_str("rawmsg"), Some("x"));
    }

    // -- rfc3164 --

    #[test]
    fn rfc3164_parses_and_normalizes_tag() {
        let parser = parser("rfc3164");
        let raw = RawRecord::with_from(
            b"<34>Oct 11 22:14:15 web1 /usr/bin/my.app: started".to_vec(),
            b"10.0.0.9".to_vec(),
        );
        let rec = parser.parse(&raw).unwrap();
        assert_eq!(rec.get_str("tag"), Some("myapp"));
        assert_eq!(rec.get_str("hostname"), Some("web1"));
        assert_eq!(rec.get_str("from"), Some("10.0.0.9"));
        assert_eq!(rec.get_str("content"), Some("started"));
    }

    #[test]
    fn rfc3164_empty_tag_becomes_misc() {
        let rec = parser("rfc3164")
            .parse(&RawRecord::new(
                b"<34>Oct 11 22:14:15 web1 ...: started".to_vec(),
            ))
            .unwrap();
        assert_eq!(rec.get_str("tag"), Some("misc"));
    }

    #[test]
    fn rfc3164_failure_keeps_raw_content() {
        let rec = parser("rfc3164")
            .parse(&RawRecord::new(b"not syslog at all".to_vec()))
            .unwrap();
        assert_eq!(rec.get_str("content"), Some("not syslog at all"));
        assert!(rec.contains_key("timestamp"));
        assert!(!rec.contains_key("tag"));
    }

    // -- customschema --

    fn schema_parser(tokens: &[&str], formats: &[(&str, &str)]) -> LogParser {
        LogParser::from_config(&ParserConfig {
            log_type: "customschema".to_string(),
            tokens: tokens.iter().map(|s| s.to_string()).collect(),
            token_format: formats
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        })
    }

    #[test]
    fn customschema_typed_tokens() {
        let parser = schema_parser(
            &["ip", "ts", "status", "bytes"],
            &[
                ("ip", "string"),
                ("ts", "nginxtimestamp"),
                ("status", "int"),
                ("bytes", "float"),
            ],
        );
        let rec = parser
            .parse(&RawRecord::new(
                b"1.2.3.4 [10/Oct/2000:13:55:36 -0700] 200 12.5 ".to_vec(),
            ))
            .unwrap();
        assert_eq!(rec.get_str("ip"), Some("1.2.3.4"));
        assert_eq!(rec.get("status"), Some(&Value::Int(200)));
        assert_eq!(rec.get("bytes"), Some(&Value::Float(12.5)));
        assert!(matches!(rec.get("ts"), Some(Value::Time(_))));
        // No inbound timestamp column, so the receive time is added.
        assert!(rec.contains_key("timestamp"));
    }

    #[test]
    fn customschema_token_count_mismatch_rejected() {
        let parser = schema_parser(&["a", "b"], &[]);
        assert!(parser.parse(&RawRecord::new(b"one two three".to_vec())).is_err());
    }

    #[test]
    fn customschema_strings_rezip_trims_empties() {
        let parser = schema_parser(&["verb path"], &[("verb path", "strings")]);
        let rec = parser
            .parse(&RawRecord::new(br#""GET  /index" "#.to_vec()))
            .unwrap();
        assert_eq!(rec.get_str("verb"), Some("GET"));
        assert_eq!(rec.get_str("path"), Some("/index"));
    }

    #[test]
    fn customschema_bad_int_rejected() {
        let parser = schema_parser(&["n"], &[("n", "int")]);
        assert!(parser.parse(&RawRecord::new(b"abc ".to_vec())).is_err());
    }

    // -- keyvalue --

    #[test]
    fn keyvalue_copies_pairs_and_keeps_raw_timestamp() {
        let rec = parser("keyvalue")
            .parse(&RawRecord::new(
                br#"{"level":"warn","timestamp":"2021-01-01"}"#.to_vec(),
            ))
            .unwrap();
        assert_eq!(rec.get_str("level"), Some("warn"));
        assert_eq!(rec.get_str("RawTimestamp"), Some("2021-01-01"));
        // Overwritten with the receive time.
        assert!(matches!(rec.get("timestamp"), Some(Value::Time(_))));
    }

    #[test]
    fn keyvalue_rejects_non_object() {
        assert!(parser("keyvalue").parse(&RawRecord::new(b"[1,2]".to_vec())).is_err());
    }
}
