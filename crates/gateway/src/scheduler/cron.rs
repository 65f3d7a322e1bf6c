//! Five-field cron evaluator (minute hour day-of-month month
//! day-of-week), evaluated against the host's local time.
//!
//! Accepted field forms: `*`, `*/N`, `N`, `N-M`, and comma lists of
//! those.

use chrono::{Datelike, NaiveDateTime, Timelike};

/// Check one cron field against a value.
fn cron_field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        if let Ok(n) = step.parse::<u32>() {
            return n > 0 && value % n == 0;
        }
        return false;
    }
    for part in field.split(',') {
        if let Some((start_s, end_s)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start_s.parse::<u32>(), end_s.parse::<u32>()) {
                if value >= start && value <= end {
                    return true;
                }
            }
        } else if let Ok(n) = part.parse::<u32>() {
            if value == n {
                return true;
            }
        }
    }
    false
}

/// Validate a cron expression: exactly five fields, each well-formed
/// and in range.
pub fn validate_cron(cron: &str) -> Result<(), String> {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!(
            "cron expression must have 5 fields, got {}",
            fields.len()
        ));
    }
    const RANGES: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 6)];
    for (field, (min, max)) in fields.iter().zip(RANGES) {
        if *field == "*" {
            continue;
        }
        if let Some(step) = field.strip_prefix("*/") {
            match step.parse::<u32>() {
                Ok(n) if n > 0 => continue,
                _ => return Err(format!("bad step in field {field:?}")),
            }
        }
        for part in field.split(',') {
            let check = |raw: &str| -> Result<(), String> {
                let n: u32 = raw
                    .parse()
                    .map_err(|_| format!("bad value {raw:?} in field {field:?}"))?;
                if n < min || n > max {
                    return Err(format!("value {n} out of range {min}-{max}"));
                }
                Ok(())
            };
            match part.split_once('-') {
                Some((start, end)) => {
                    check(start)?;
                    check(end)?;
                }
                None => check(part)?,
            }
        }
    }
    Ok(())
}

/// Does this local datetime (truncated to the minute) match the
/// expression?
pub fn cron_matches(cron: &str, dt: &NaiveDateTime) -> bool {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    cron_field_matches(fields[0], dt.minute())
        && cron_field_matches(fields[1], dt.hour())
        && cron_field_matches(fields[2], dt.day())
        && cron_field_matches(fields[3], dt.month())
        && cron_field_matches(fields[4], dt.weekday().num_days_from_sunday())
}

/// The host's timezone as reported to agents: a fixed offset string
/// like `UTC+02:00`.
pub fn local_timezone_name() -> String {
    let offset = chrono::Local::now().offset().local_minus_utc();
    let sign = if offset < 0 { '-' } else { '+' };
    let abs = offset.abs();
    format!("UTC{}{:02}:{:02}", sign, abs / 3600, (abs % 3600) / 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 15)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn every_five_minutes() {
        for minute in (0..60).step_by(5) {
            assert!(cron_matches("*/5 * * * *", &at(10, minute)), "{minute}");
        }
        for minute in [1, 3, 7, 59, 13] {
            assert!(!cron_matches("*/5 * * * *", &at(10, minute)), "{minute}");
        }
    }

    #[test]
    fn specific_time_and_ranges() {
        assert!(cron_matches("30 9 * * *", &at(9, 30)));
        assert!(!cron_matches("30 9 * * *", &at(10, 30)));
        assert!(cron_matches("0 9-17 * * *", &at(12, 0)));
        assert!(!cron_matches("0 9-17 * * *", &at(20, 0)));
        assert!(cron_matches("0,15,30,45 * * * *", &at(3, 45)));
        assert!(!cron_matches("0,15,30,45 * * * *", &at(3, 50)));
    }

    #[test]
    fn day_of_week_is_sunday_zero() {
        // 2024-06-15 is a Saturday.
        assert!(cron_matches("* * * * 6", &at(0, 0)));
        assert!(!cron_matches("* * * * 0", &at(0, 0)));
    }

    #[test]
    fn validation_accepts_spec_grammar() {
        for good in ["* * * * *", "*/5 * * * *", "30 9 * * 1-5", "0,30 */2 1 6 *"] {
            assert!(validate_cron(good).is_ok(), "{good}");
        }
    }

    #[test]
    fn validation_rejects_malformed() {
        for bad in [
            "* * * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "*/0 * * * *",
            "a * * * *",
            "1-99 * * * *",
        ] {
            assert!(validate_cron(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn timezone_name_shape() {
        let name = local_timezone_name();
        assert!(name.starts_with("UTC"));
        assert!(name.contains(':'));
    }
}
