//! Portal run ids: `YYYYMMDD` (UTC) followed by 8 lowercase hex digits.

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

/// Generate a portal run id for a run created now.
pub fn generate_portal_run_id() -> String {
    portal_run_id_at(Utc::now())
}

/// Generate a portal run id dated `at`.
pub fn portal_run_id_at(at: DateTime<Utc>) -> String {
    let random = &Uuid::new_v4().simple().to_string()[..8];
    format!("{}{}", at.format("%Y%m%d"), random)
}

/// Whether `id` has the portal run id shape.
pub fn is_portal_run_id(id: &str) -> bool {
    if id.len() != 16 || !id.is_ascii() {
        return false;
    }
    let (date, suffix) = id.split_at(8);
    NaiveDate::parse_from_str(date, "%Y%m%d").is_ok()
        && suffix
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}
