use std::sync::LazyLock;
use std::time::Duration;

use chrono::NaiveDate;
use regex::Regex;

use super::error::{CrawlError, Result};

/// ROC era year 1 is Gregorian 1912.
pub const ROC_YEAR_OFFSET: i32 = 1911;

static ROC_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{2,3})/(\d{2})/(\d{2})").expect("valid ROC date regex"));

/// Exactly one `:` is required. The fractional part of the seconds is optional.
pub fn parse_race_time(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let invalid = || CrawlError::extraction(format!("malformed race time {raw:?}, expected mm:ss.hh"));

    let mut parts = raw.split(':');
    let (Some(minutes), Some(seconds), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid());
    };

    let minutes = parse_digits(minutes).ok_or_else(invalid)?;
    let (whole, fraction) = match seconds.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (seconds, ""),
    };
    let whole = parse_digits(whole).ok_or_else(invalid)?;
    let nanos = parse_fraction_nanos(fraction).ok_or_else(invalid)?;

    let secs = minutes
        .checked_mul(60)
        .and_then(|m| m.checked_add(whole))
        .ok_or_else(invalid)?;
    Ok(Duration::new(secs, nanos))
}

pub fn format_race_time(duration: Duration) -> String {
    let total = duration.as_secs();
    let hundredths = duration.subsec_millis() / 10;
    format!("{:02}:{:02}.{:02}", total / 60, total % 60, hundredths)
}

pub fn find_roc_date(text: &str) -> Result<NaiveDate> {
    let caps = ROC_DATE_RE
        .captures(text)
        .ok_or_else(|| CrawlError::extraction(format!("no ROC date found in {:?}", text.trim())))?;

    let roc_year: i32 = caps[1]
        .parse()
        .map_err(|_| CrawlError::extraction(format!("bad ROC year in {:?}", &caps[0])))?;
    let month: u32 = caps[2]
        .parse()
        .map_err(|_| CrawlError::extraction(format!("bad month in {:?}", &caps[0])))?;
    let day: u32 = caps[3]
        .parse()
        .map_err(|_| CrawlError::extraction(format!("bad day in {:?}", &caps[0])))?;

    NaiveDate::from_ymd_opt(roc_year + ROC_YEAR_OFFSET, month, day).ok_or_else(|| {
        CrawlError::extraction(format!("{:?} is not a calendar date", &caps[0]))
    })
}

pub fn parse_count(raw: &str) -> Result<i32> {
    let raw = raw.trim();
    raw.parse::<i32>()
        .map_err(|err| CrawlError::extraction(format!("expected integer, got {raw:?}: {err}")))
}

pub fn normalize_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_digits(raw: &str) -> Option<u64> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

fn parse_fraction_nanos(raw: &str) -> Option<u32> {
    if raw.is_empty() {
        return Some(0);
    }
    if raw.len() > 9 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let padded = format!("{raw:0<9}");
    padded.parse().ok()
}

pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
