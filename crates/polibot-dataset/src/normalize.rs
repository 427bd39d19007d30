//! Expiry and premium normalization for raw dataset values.

use chrono::{Datelike, Duration, NaiveDate};
use serde::Deserialize;

/// Day 0 of the spreadsheet serial date system.
const SERIAL_EPOCH: (i32, u32, u32) = (1899, 12, 30);

/// An expiry cell as it appears in the source data: already text, or a
/// spreadsheet serial day count.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExpiryValue {
    Text(String),
    Serial(f64),
}

/// Normalize an expiry cell to `D.M.YYYY` text. Returns `None` when the
/// value cannot be interpreted as a date; such rows are carried through
/// with an absent expiry and simply never match.
pub fn normalize_expiry(value: &ExpiryValue) -> Option<String> {
    match value {
        ExpiryValue::Text(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        ExpiryValue::Serial(serial) => serial_to_date(*serial).map(|date| {
            format!("{}.{}.{}", date.day(), date.month(), date.year())
        }),
    }
}

/// Convert a spreadsheet serial day count (days since 1899-12-30) to a
/// calendar date. Rejects non-finite values and serials outside a sane
/// range.
pub fn serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() {
        return None;
    }
    let days = serial.round() as i64;
    // Serial 1 is 1899-12-31; anything non-positive or past year ~2200
    // is not a plausible expiry date.
    if !(1..=110_000).contains(&days) {
        return None;
    }
    let (y, m, d) = SERIAL_EPOCH;
    NaiveDate::from_ymd_opt(y, m, d)?.checked_add_signed(Duration::days(days))
}

/// Render a numeric premium with two decimal places.
pub fn format_premium(value: f64) -> String {
    format!("{value:.2}")
}
