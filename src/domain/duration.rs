// ===== Duration String Codec =====
//
// The variable service exchanges lock TTLs as duration strings such as
// "15s", "1m30s" or "250ms".

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

const NANOS_PER_MICRO: u128 = 1_000;
const NANOS_PER_MILLI: u128 = 1_000_000;
const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Parse a duration string like "15s", "1h2m3.5s" or "250ms".
pub fn parse_duration(duration_str: &str) -> Result<Duration, String> {
    static COMPONENT_REGEX: OnceLock<Regex> = OnceLock::new();
    let re = COMPONENT_REGEX.get_or_init(|| {
        Regex::new(r"(\d+\.?\d*|\.\d+)(ns|us|µs|μs|ms|s|m|h)").expect("Invalid duration regex")
    });

    let input = duration_str.trim();
    if input.is_empty() {
        return Err("Invalid duration: empty string".to_string());
    }
    if input == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_nanos: f64 = 0.0;
    let mut consumed = 0;
    for caps in re.captures_iter(input) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        if whole.start() != consumed {
            return Err(format!("Invalid duration format: {}", duration_str));
        }
        consumed = whole.end();

        let number: f64 = caps[1]
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", &caps[1]))?;

        let unit_nanos = match &caps[2] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            unit => return Err(format!("Invalid duration unit: {}", unit)),
        };
        total_nanos += number * unit_nanos;
    }

    if consumed != input.len() {
        return Err(format!(
            "Invalid duration format: {}. Expected format like 15s, 1m30s or 250ms",
            duration_str
        ));
    }

    let total_nanos = total_nanos.round();
    if !total_nanos.is_finite() || total_nanos >= u64::MAX as f64 {
        return Err(format!("Duration out of range: {}", duration_str));
    }
    Ok(Duration::from_nanos(total_nanos as u64))
}

/// Format a duration the way the variable service expects it ("1m30s").
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }

    if nanos < NANOS_PER_MICRO {
        return format!("{}ns", nanos);
    }
    if nanos < NANOS_PER_MILLI {
        return format!("{}µs", fraction(nanos, NANOS_PER_MICRO));
    }
    if nanos < NANOS_PER_SEC {
        return format!("{}ms", fraction(nanos, NANOS_PER_MILLI));
    }

    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = fraction(
        u128::from(total_secs % 60) * NANOS_PER_SEC + u128::from(duration.subsec_nanos()),
        NANOS_PER_SEC,
    );

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    out.push_str(&format!("{}s", seconds));
    out
}

/// Renders `value / unit` with trailing fractional zeros removed.
fn fraction(value: u128, unit: u128) -> String {
    let whole = value / unit;
    let rem = value % unit;
    if rem == 0 {
        return whole.to_string();
    }

    let width = unit.to_string().len() - 1;
    let digits = format!("{:0width$}", rem, width = width);
    format!("{}.{}", whole, digits.trim_end_matches('0'))
}
