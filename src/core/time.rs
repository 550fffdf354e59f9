use std::fmt;

use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime, UtcOffset};

/// Milliseconds since the UNIX epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct Timestamp(i64);

impl Timestamp {
    pub(crate) fn now() -> Self {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    pub(crate) const fn zero() -> Self {
        Self(0)
    }

    pub(crate) const fn from_msecs(msecs: i64) -> Self {
        Self(msecs)
    }

    pub(crate) const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    pub(crate) fn from_datetime(value: OffsetDateTime) -> Self {
        Self((value.unix_timestamp_nanos() / 1_000_000) as i64)
    }

    pub(crate) const fn to_msecs(self) -> i64 {
        self.0
    }

    pub(crate) const fn to_secs(self) -> i64 {
        self.0.div_euclid(1000)
    }

    pub(crate) const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub(crate) const fn add_msecs(self, msecs: i64) -> Self {
        Self(self.0.saturating_add(msecs))
    }

    pub(crate) fn to_datetime(self) -> OffsetDateTime {
        let nanos = i128::from(self.0) * 1_000_000;
        OffsetDateTime::from_unix_timestamp_nanos(nanos).unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    pub(crate) fn to_datetime_at(self, offset: UtcOffset) -> OffsetDateTime {
        self.to_datetime().to_offset(offset)
    }

    /// Parse an RFC3339 string (e.g. `2024-01-02T03:04:05Z`).
    pub(crate) fn parse_rfc3339(value: &str) -> Option<Self> {
        OffsetDateTime::parse(value.trim(), &Rfc3339).ok().map(Self::from_datetime)
    }

    pub(crate) fn to_rfc3339(self) -> String {
        format_offset(self.to_datetime())
    }

    /// Compact form used in file names: `YYYYMMDDhhmmss`.
    pub(crate) fn to_compact_string(self) -> String {
        let value = self.to_datetime();
        format!(
            "{:04}{:02}{:02}{:02}{:02}{:02}",
            value.year(),
            u8::from(value.month()),
            value.day(),
            value.hour(),
            value.minute(),
            value.second()
        )
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

pub(crate) fn format_offset(value: OffsetDateTime) -> String {
    value.format(&Rfc3339).unwrap_or_else(|_| value.to_string())
}

/// Render a millisecond duration the way people read it: `1d2h3m4s`, `250ms`, `-5s`.
pub(crate) fn format_duration_msecs(msecs: i64) -> String {
    if msecs == 0 {
        return String::from("0s");
    }

    let sign = if msecs < 0 { "-" } else { "" };
    let mut remaining = msecs.unsigned_abs();
    if remaining < 1000 {
        return format!("{sign}{remaining}ms");
    }

    let mut output = String::from(sign);
    for (unit, size) in [("d", 86_400_000u64), ("h", 3_600_000), ("m", 60_000), ("s", 1000)] {
        let count = remaining / size;
        if count > 0 {
            output.push_str(&format!("{count}{unit}"));
            remaining %= size;
        }
    }

    output
}

/// Inverse of [`format_duration_msecs`]: `1h30m`, `90s`, `250ms`, `-2d`.
pub(crate) fn parse_duration_msecs(value: &str) -> Option<i64> {
    let value = value.trim();
    let (negative, mut rest) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value.strip_prefix('+').unwrap_or(value)),
    };

    if rest.is_empty() {
        return None;
    }

    let mut total: i64 = 0;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }

        let count: i64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let size = match &rest[..unit_len] {
            "ms" => 1,
            "s" => 1000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            _ => return None,
        };
        rest = &rest[unit_len..];

        total = total.checked_add(count.checked_mul(size)?)?;
    }

    Some(if negative { -total } else { total })
}
