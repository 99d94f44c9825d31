use chrono::{DateTime, Datelike, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

// ---------------------------------------------------------------------------
// Minimal RFC 3164 (BSD syslog) message parser
// ---------------------------------------------------------------------------

/// A parsed RFC 3164 message:
/// `<PRI>MMM dd hh:mm:ss HOSTNAME TAG[pid]: CONTENT`.
#[derive(Debug, Clone, PartialEq)]
pub struct Rfc3164Message {
    pub priority: u8,
    pub facility: u8,
    pub severity: u8,
    pub timestamp: DateTime<Utc>,
    pub hostname: String,
    pub tag: String,
    pub content: String,
}

/// Parse a raw syslog payload. The year is taken from the current date
/// (RFC 3164 timestamps carry none); `timezone` is the zone the timestamp
/// is interpreted in (UTC when absent).
pub fn parse(msg: &[u8], timezone: Option<Tz>) -> Result<Rfc3164Message, String> {
    let text = std::str::from_utf8(msg)
        .map_err(|_| "payload is not utf-8".to_string())?
        .trim_end_matches(['\r', '\n']);

    let (priority, rest) = parse_priority(text)?;
    let (timestamp, rest) = parse_timestamp(rest, timezone)?;

    let rest = rest.trim_start();
    let (hostname, rest) = match rest.split_once(' ') {
        Some((host, tail)) => (host.to_string(), tail.trim_start()),
        None => return Err("missing hostname".to_string()),
    };

    let (tag, content) = parse_tag(rest);

    Ok(Rfc3164Message {
        priority,
        facility: priority / 8,
        severity: priority % 8,
        timestamp,
        hostname,
        tag,
        content,
    })
}

fn parse_priority(text: &str) -> Result<(u8, &str), String> {
    let inner = text
        .strip_prefix('<')
        .ok_or_else(|| "missing priority".to_string())?;
    let end = inner
        .find('>')
        .ok_or_else(|| "unterminated priority".to_string())?;
    if end == 0 || end > 3 {
        return Err("bad priority length".to_string());
    }
    let pri: u16 = inner[..end]
        .parse()
        .map_err(|_| "bad priority value".to_string())?;
    if pri > 191 {
        return Err("priority out of range".to_string());
    }
    Ok((pri as u8, &inner[end + 1..]))
}

/// `MMM dd hh:mm:ss`, day space-padded (`Oct  7`) or zero-padded.
fn parse_timestamp(text: &str, timezone: Option<Tz>) -> Result<(DateTime<Utc>, &str), String> {
    const TS_LEN: usize = 15;
    if text.len() < TS_LEN {
        return Err("timestamp too short".to_string());
    }
    let (ts, rest) = text.split_at(TS_LEN);

    let month = match &ts[..3] {
        "Jan" => 1,
        "Feb" => 2,
        "Mar" => 3,
        "Apr" => 4,
        "May" => 5,
        "Jun" => 6,
        "Jul" => 7,
        "Aug" => 8,
        "Sep" => 9,
        "Oct" => 10,
        "Nov" => 11,
        "Dec" => 12,
        other => return Err(format!("bad month {other:?}")),
    };
    let day: u32 = ts[3..6]
        .trim()
        .parse()
        .map_err(|_| "bad day".to_string())?;
    let hour: u32 = ts[7..9].parse().map_err(|_| "bad hour".to_string())?;
    let min: u32 = ts[10..12].parse().map_err(|_| "bad minute".to_string())?;
    let sec: u32 = ts[13..15].parse().map_err(|_| "bad second".to_string())?;

    let year = Utc::now().year();
    let naive = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, min, sec))
        .ok_or_else(|| "timestamp out of range".to_string())?;

    let timestamp = match timezone {
        Some(tz) => match tz.from_local_datetime(&naive) {
            LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => t.with_timezone(&Utc),
            LocalResult::None => return Err("timestamp not valid in timezone".to_string()),
        },
        None => Utc.from_utc_datetime(&naive),
    };
    Ok((timestamp, rest))
}

/// Split `TAG[pid]: CONTENT`. A tag is the leading token ending in `:` with
/// no internal spaces; when none is present the whole rest is content.
fn parse_tag(rest: &str) -> (String, String) {
    if let Some((head, tail)) = rest.split_once(':')
        && !head.contains(' ')
    {
        let tag = match head.split_once('[') {
            Some((name, _pid)) => name,
            None => head,
        };
        return (tag.to_string(), tail.trim_start().to_string());
    }
    (String::new(), rest.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
