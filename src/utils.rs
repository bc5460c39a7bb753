use chrono::{DateTime, Local, Utc};
use log::LevelFilter;
use std::env;

use crate::cli::Args;

pub fn parse_bool_env(var: &str) -> bool {
    if let Ok(val) = env::var(var) {
        let trimmed = val.trim();
        trimmed == "1" || trimmed.eq_ignore_ascii_case("true")
    } else {
        false
    }
}

/// Caller identity: `--user` / `BILLABLE_USER`, then the login name, then `local`.
pub fn resolve_user(args: &Args) -> String {
    args.user
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .or_else(|| {
            env::var("USER")
                .ok()
                .filter(|u| !u.trim().is_empty())
        })
        .unwrap_or_else(|| "local".to_string())
}

/// Route `log` output to stderr. Warnings only unless debug is requested.
pub fn setup_logger(debug: bool) -> anyhow::Result<()> {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}

pub fn format_currency(v: f64) -> String {
    format!("{v:.2}")
}

pub fn format_hours(v: f64) -> String {
    format!("{v:.2}h")
}

/// `1h 02m 05s`, `4m 10s`, `12s`
pub fn format_duration(total_seconds: i64) -> String {
    let secs = total_seconds.max(0);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

pub fn format_local_time(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}
