//! Parsing of the cron expressions binding the scheduled tiers.

use std::str::FromStr;

use cron::Schedule;
use derive_more::{Display, Error};

use crate::backup::Tier;

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// The cron expression configured for a tier can't be parsed.
#[derive(Debug, Display, Error)]
#[display("Invalid cron expression for {tier} backups '{expression}': {source}")]
pub struct ScheduleConfigError {
    pub tier: Tier,
    pub expression: String,
    pub source: cron::error::Error,
}

/// Parses a classic five field expression (`min hour dom month dow`, Sunday
/// being `0` or `7`) or a six/seven field expression with seconds.
pub fn parse(tier: Tier, expression: &str) -> Result<Schedule, ScheduleConfigError> {
    Schedule::from_str(&normalize(expression)).map_err(|source| ScheduleConfigError {
        tier,
        expression: expression.to_string(),
        source,
    })
}

/// Rewrites a five field expression into the seconds-first dialect.
///
/// Other expressions pass through unchanged.
pub fn normalize(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return expression.trim().to_string();
    }

    let day_of_week = fields[4]
        .split(',')
        .map(day_of_week_item)
        .collect::<Vec<_>>()
        .join(",");

    format!(
        "0 {} {} {} {} {day_of_week}",
        fields[0], fields[1], fields[2], fields[3]
    )
}

fn day_of_week_item(item: &str) -> String {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (item, None),
    };

    let range = range
        .split('-')
        .map(|day| match day.parse::<usize>() {
            Ok(n) if n <= 7 => DAY_NAMES[n % 7].to_string(),
            _ => day.to_string(),
        })
        .collect::<Vec<_>>()
        .join("-");

    match step {
        Some(step) => format!("{range}/{step}"),
        None => range,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike, Utc, Weekday};

    #[test]
    fn five_fields_gain_seconds() {
        assert_eq!(normalize("0 2 * * *"), "0 0 2 * * *");
        assert_eq!(normalize(" 0 2 * * * "), "0 0 2 * * *");
        assert_eq!(normalize("0 0 2 * * * 2030"), "0 0 2 * * * 2030");
    }

    #[test]
    fn numeric_weekdays_become_names() {
        assert_eq!(normalize("0 3 * * 0"), "0 0 3 * * SUN");
        assert_eq!(normalize("0 3 * * 7"), "0 0 3 * * SUN");
        assert_eq!(normalize("0 3 * * 1-5"), "0 0 3 * * MON-FRI");
        assert_eq!(normalize("0 3 * * 1,3"), "0 0 3 * * MON,WED");
        assert_eq!(normalize("0 3 * * */2"), "0 0 3 * * */2");
        assert_eq!(normalize("0 3 * * SAT"), "0 0 3 * * SAT");
    }

    #[test]
    fn default_schedules_parse() {
        let weekly = parse(Tier::Weekly, "0 3 * * 0").unwrap();
        let next = weekly.upcoming(Utc).next().unwrap();

        assert_eq!(next.weekday(), Weekday::Sun);
        assert_eq!((next.hour(), next.minute(), next.second()), (3, 0, 0));
        assert!(parse(Tier::Daily, "0 2 * * *").is_ok());
        assert!(parse(Tier::Monthly, "0 4 1 * *").is_ok());
    }

    #[test]
    fn garbage_is_rejected_with_context() {
        let err = parse(Tier::Monthly, "not a cron").unwrap_err();

        assert_eq!(err.tier, Tier::Monthly);
        assert_eq!(err.expression, "not a cron");
        assert!(std::error::Error::source(&err).is_some());
        assert!(parse(Tier::Daily, "61 2 * * *").is_err());
    }
}
