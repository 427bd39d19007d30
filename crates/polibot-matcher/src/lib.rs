//! polibot-matcher: pure expiry matching and message rendering.
//!
//! Given a normalized row list and a calendar date, selects the rows whose
//! expiry falls on that date and renders the notification body. No I/O and
//! no state; the scheduler calls this on every fire.

use chrono::{Datelike, NaiveDate};

use polibot_types::DatasetRow;

/// Parse `D.M.YYYY` (or `D/M/YYYY`) text into a date, tolerating zero
/// padding. Returns `None` for anything that does not look like a
/// day.month.year value.
fn parse_day_month_year(text: &str) -> Option<NaiveDate> {
    let sep = if text.contains('.') { '.' } else { '/' };
    let mut parts = text.trim().split(sep);
    let day: u32 = parts.next()?.trim().parse().ok()?;
    let month: u32 = parts.next()?.trim().parse().ok()?;
    let year: i32 = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Select the rows whose expiry date equals `today`, preserving input
/// order. Rows with absent or unparseable expiry are skipped, never an
/// error.
pub fn expiring_today(rows: &[DatasetRow], today: NaiveDate) -> Vec<DatasetRow> {
    rows.iter()
        .filter(|row| {
            row.expiry
                .as_deref()
                .and_then(parse_day_month_year)
                .is_some_and(|date| date == today)
        })
        .cloned()
        .collect()
}

/// Format a date the way the notification body shows it (unpadded
/// day.month.year).
pub fn format_date(date: NaiveDate) -> String {
    format!("{}.{}.{}", date.day(), date.month(), date.year())
}

/// Render the notification body for a non-empty match list: a header
/// carrying `today`, one block per policy, and a trailing count summary.
///
/// Callers must skip dispatch entirely when `matches` is empty; this
/// function is only meaningful for non-empty input.
pub fn render_message(matches: &[DatasetRow], today: NaiveDate) -> String {
    let mut body = format!("Policies expiring today ({}):\n\n", format_date(today));
    for row in matches {
        body.push_str(&format!("Customer: {}\n", row.customer));
        body.push_str(&format!("Plate: {}\n", row.plate));
        body.push_str(&format!(
            "Expiry: {}\n",
            row.expiry.as_deref().unwrap_or("-")
        ));
        body.push_str(&format!("Premium: {}\n", row.premium));
        body.push_str(&format!("Company: {}\n\n", row.company));
    }
    body.push_str(&format!(
        "Total: {} expiring today. Please contact the affected customers.",
        matches.len()
    ));
    body
}
