#[cfg(feature = "events")]
use chrono::{DateTime, Duration, TimeZone, Utc};
#[cfg(feature = "events")]
use regex::Regex;

/// Pulls the bracketed game log timestamp (`[2025.08.04-12.34.56:789]`)
/// off the front of a line.
#[cfg(feature = "events")]
pub fn extract_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let re = Regex::new(r"^\[(\d{4})\.(\d{2})\.(\d{2})-(\d{2})\.(\d{2})\.(\d{2}):(\d{3})\]")
        .unwrap();
    let caps = re.captures(input)?;

    let field = |i: usize| caps[i].parse::<u32>().ok();
    let (year, month, day) = (caps[1].parse::<i32>().ok()?, field(2)?, field(3)?);
    let (hour, minute, second, millis) = (field(4)?, field(5)?, field(6)?, field(7)?);

    let base = Utc
        .with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()?;
    Some(base + Duration::milliseconds(i64::from(millis)))
}
