//! Imperatives: inline scheduled commands (`Notify @daily:9am …`,
//! `Run action:x @hourly`) extracted from prose into schedule tokens.

use std::str::FromStr;
use std::time::Duration;

use cron::Schedule;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::prelude::*;

static NOTIFY_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Notify\s+(@\S+)\s+(.+)$").unwrap());
static RUN_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Run\s+action:([A-Za-z0-9_-]+)\s+(\S.*)$").unwrap());
static CLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2})(?::(\d{2}))?(am|pm)?$").unwrap());

#[derive(Debug, Clone)]
pub enum ImperativeKind {
    Notify { message: String },
    Run { action: String },
}

#[derive(Debug, Clone)]
pub struct Imperative {
    pub kind: ImperativeKind,
    pub schedule: ScheduleSpec,
    pub raw: String,
}

/// A normalized schedule: either a cron expression or a fixed interval.
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    Cron(Schedule),
    Every(Duration),
}

/// Pull imperative lines out of the body. Matched lines are removed from the
/// prose; anything else passes through untouched.
pub fn extract(body: &str) -> Result<(String, Vec<Imperative>)> {
    let mut imperatives = Vec::new();
    let mut kept = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();

        if let Some(caps) = NOTIFY_LINE.captures(trimmed) {
            imperatives.push(Imperative {
                kind: ImperativeKind::Notify {
                    message: caps[2].trim().to_owned(),
                },
                schedule: parse_schedule(&caps[1])
                    .wrap_err_with(|| format!("Bad schedule in '{trimmed}'."))?,
                raw: trimmed.to_owned(),
            });
            continue;
        }

        if let Some(caps) = RUN_LINE.captures(trimmed) {
            imperatives.push(Imperative {
                kind: ImperativeKind::Run {
                    action: caps[1].to_owned(),
                },
                schedule: parse_schedule(caps[2].trim())
                    .wrap_err_with(|| format!("Bad schedule in '{trimmed}'."))?,
                raw: trimmed.to_owned(),
            });
            continue;
        }

        kept.push(line);
    }

    let mut body = kept.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }

    Ok((body, imperatives))
}

/// Supported forms: standard 5-field cron, `@hourly`, `@daily:HH:MM`,
/// `@weekly:DOW:HH:MM`, `@every:Ns|Nm|Nh`.
pub fn parse_schedule(token: &str) -> Result<ScheduleSpec> {
    let token = token.trim();

    if let Some(rest) = token.strip_prefix("@every:") {
        return parse_interval(rest).map(ScheduleSpec::Every);
    }

    if token == "@hourly" {
        return cron_spec("0 0 * * * *");
    }

    if let Some(rest) = token.strip_prefix("@daily:") {
        let (hour, minute) = parse_clock(rest)?;
        return cron_spec(&format!("0 {minute} {hour} * * *"));
    }

    if let Some(rest) = token.strip_prefix("@weekly:") {
        let (dow, clock) = rest
            .split_once(':')
            .ok_or_else(|| eyre!("'@weekly:' needs a day and a time."))?;
        let (hour, minute) = parse_clock(clock)?;
        let dow = normalize_dow(dow)?;
        return cron_spec(&format!("0 {minute} {hour} * * {dow}"));
    }

    if token.starts_with('@') {
        bail!("Unknown schedule token '{token}'.");
    }

    // 5-field cron; the cron crate wants a seconds field up front.
    ensure!(
        token.split_whitespace().count() == 5,
        "Cron expressions take 5 fields, got '{token}'."
    );
    cron_spec(&format!("0 {token}"))
}

fn cron_spec(expr: &str) -> Result<ScheduleSpec> {
    Schedule::from_str(expr)
        .map(ScheduleSpec::Cron)
        .wrap_err_with(|| format!("Invalid cron expression '{expr}'."))
}

/// `9am`, `9:30pm`, `17:30`, `09`.
fn parse_clock(raw: &str) -> Result<(u32, u32)> {
    let lowered = raw.trim().to_ascii_lowercase();
    let caps = CLOCK
        .captures(&lowered)
        .ok_or_else(|| eyre!("'{raw}' is not a time of day."))?;

    let mut hour: u32 = caps[1].parse()?;
    let minute: u32 = caps.get(2).map(|m| m.as_str().parse()).transpose()?.unwrap_or(0);

    match caps.get(3).map(|m| m.as_str()) {
        Some("pm") if hour < 12 => hour += 12,
        Some("am") if hour == 12 => hour = 0,
        _ => {}
    }

    ensure!(hour < 24 && minute < 60, "'{raw}' is out of range.");
    Ok((hour, minute))
}

fn normalize_dow(raw: &str) -> Result<String> {
    let raw = raw.trim().to_ascii_lowercase();

    let name = match raw.as_str() {
        "mon" | "monday" | "1" => "MON",
        "tue" | "tuesday" | "2" => "TUE",
        "wed" | "wednesday" | "3" => "WED",
        "thu" | "thursday" | "4" => "THU",
        "fri" | "friday" | "5" => "FRI",
        "sat" | "saturday" | "6" => "SAT",
        "sun" | "sunday" | "0" | "7" => "SUN",
        other => bail!("Unknown day of week '{other}'."),
    };

    Ok(name.to_owned())
}

fn parse_interval(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let (digits, unit) = raw.split_at(raw.len().saturating_sub(1));
    let n: u64 = digits
        .parse()
        .wrap_err_with(|| format!("Bad interval '{raw}'."))?;

    ensure!(n > 0, "Interval '{raw}' must be positive.");

    match unit {
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        other => bail!("Unknown interval unit '{other}' (use s, m or h)."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn extracts_and_strips_imperative_lines() {
        let body = "# Ops\n\nNotify @daily:9am Standup reminder\n\nprose\n\nRun action:cleanup @hourly\n";
        let (kept, imperatives) = extract(body).unwrap();

        assert_eq!(imperatives.len(), 2);
        assert!(matches!(
            &imperatives[0].kind,
            ImperativeKind::Notify { message } if message == "Standup reminder"
        ));
        assert!(matches!(
            &imperatives[1].kind,
            ImperativeKind::Run { action } if action == "cleanup"
        ));

        assert!(!kept.contains("Notify"));
        assert!(!kept.contains("Run action:"));
        assert!(kept.contains("prose"));
    }

    #[test]
    fn daily_token_lands_on_the_right_hour() {
        let ScheduleSpec::Cron(schedule) = parse_schedule("@daily:9am").unwrap() else {
            panic!("expected cron");
        };

        let next = schedule.upcoming(chrono::Utc).next().unwrap();
        assert_eq!(next.hour(), 9);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn weekly_token_lands_on_the_right_day() {
        let ScheduleSpec::Cron(schedule) = parse_schedule("@weekly:mon:17:30").unwrap() else {
            panic!("expected cron");
        };

        let next = schedule.upcoming(chrono::Utc).next().unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Mon);
        assert_eq!(next.hour(), 17);
        assert_eq!(next.minute(), 30);
    }

    #[test]
    fn every_token_is_an_interval() {
        let ScheduleSpec::Every(d) = parse_schedule("@every:30s").unwrap() else {
            panic!("expected interval");
        };
        assert_eq!(d, Duration::from_secs(30));

        let ScheduleSpec::Every(d) = parse_schedule("@every:2h").unwrap() else {
            panic!("expected interval");
        };
        assert_eq!(d, Duration::from_secs(7200));
    }

    #[test]
    fn five_field_cron_is_accepted() {
        assert!(matches!(
            parse_schedule("*/5 * * * *").unwrap(),
            ScheduleSpec::Cron(_)
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_schedule("@fortnightly").is_err());
        assert!(parse_schedule("not cron at all").is_err());
        assert!(parse_schedule("@daily:25:00").is_err());
        assert!(parse_schedule("@every:10x").is_err());
    }
}
