use chrono::{DateTime, Duration, NaiveDate, Utc};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use regex::Regex;
use reqguard_session::default_data_dir;
use std::path::PathBuf;
use std::sync::Once;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

static TRACING_INIT: Once = Once::new();

/// Installs the `tracing` subscriber once. `RUST_LOG` overrides the default `warn` level.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    });
}

/// Resolves the data directory: the explicit `--data-dir`, else the platform config dir.
pub fn resolve_data_dir(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            Ok(dir)
        }
        None => default_data_dir(),
    }
}

/// Parse time expressions like "3 days ago", "2025-01-15" or an RFC 3339 timestamp.
pub fn parse_time_expression(expr: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let raw = expr.trim();
    let expr = raw.to_lowercase();

    if expr == "now" {
        return Ok(now);
    }

    // Only non-negative counts are accepted
    let re = Regex::new(r"^(\d+)\s+(minute|hour|day|week)s?\s+ago$").map_err(|e| eyre!("Regex error: {}", e))?;

    if let Some(caps) = re.captures(&expr) {
        let number: i64 = caps[1]
            .parse()
            .map_err(|_| eyre!("Invalid number in time expression"))?;

        let duration = match &caps[2] {
            "minute" => Duration::try_minutes(number),
            "hour" => Duration::try_hours(number),
            "day" => Duration::try_days(number),
            "week" => Duration::try_weeks(number),
            unit => return Err(eyre!("Unknown time unit: {}", unit)),
        }
        .ok_or_else(|| eyre!("Time expression is out of range: '{}'", expr))?;

        return now
            .checked_sub_signed(duration)
            .ok_or_else(|| eyre!("Time expression is out of range: '{}'", expr));
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }

    if let Ok(datetime) = DateTime::parse_from_rfc3339(raw) {
        return Ok(datetime.with_timezone(&Utc));
    }

    Err(eyre!("Unable to parse time expression: '{}'", raw))
}

/// Reads a secret from the terminal without echo.
pub fn prompt_secret(prompt: &str) -> Result<Zeroizing<String>> {
    Ok(Zeroizing::new(rpassword::prompt_password(prompt)?))
}

/// Same as [`prompt_secret`] but off the async workers.
pub async fn prompt_secret_async(prompt: &'static str) -> Result<Zeroizing<String>> {
    tokio::task::spawn_blocking(move || prompt_secret(prompt)).await?
}
