//! Kubernetes quantity and duration parsing
//!
//! Storage sizes are handled as bytes everywhere inside the operator and only
//! converted back to quantity strings at the volume-claim boundary.

use std::time::Duration;

use super::PolicyError;

const KI: u64 = 1 << 10;
const MI: u64 = 1 << 20;
const GI: u64 = 1 << 30;
const TI: u64 = 1 << 40;
const PI: u64 = 1 << 50;
const EI: u64 = 1 << 60;

fn suffix_multiplier(suffix: &str) -> Option<u64> {
    let m = match suffix {
        "" => 1,
        "Ki" => KI,
        "Mi" => MI,
        "Gi" => GI,
        "Ti" => TI,
        "Pi" => PI,
        "Ei" => EI,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        _ => return None,
    };
    Some(m)
}

/// Parse a quantity such as `500Mi`, `1.5Gi` or `10G` into bytes.
///
/// Fractional byte counts are rounded up.
pub fn parse_quantity(input: &str) -> Result<u64, PolicyError> {
    let invalid = || PolicyError::InvalidQuantity(input.to_string());

    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    if number.is_empty() {
        return Err(invalid());
    }
    let multiplier = suffix_multiplier(suffix).ok_or_else(invalid)? as u128;

    let (whole, frac) = match number.split_once('.') {
        Some((w, f)) => (w, f),
        None => (number, ""),
    };
    if (whole.is_empty() && frac.is_empty()) || frac.contains('.') || frac.len() > 9 {
        return Err(invalid());
    }

    let whole: u128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let mut bytes = whole.checked_mul(multiplier).ok_or_else(invalid)?;

    if !frac.is_empty() {
        let digits: u128 = frac.parse().map_err(|_| invalid())?;
        let scale = 10u128.pow(frac.len() as u32);
        let scaled = digits * multiplier;
        bytes += scaled.div_ceil(scale);
    }

    u64::try_from(bytes).map_err(|_| invalid())
}

/// Format bytes as the largest binary quantity that represents them exactly.
pub fn format_quantity(bytes: u64) -> String {
    const UNITS: [(u64, &str); 6] = [
        (EI, "Ei"),
        (PI, "Pi"),
        (TI, "Ti"),
        (GI, "Gi"),
        (MI, "Mi"),
        (KI, "Ki"),
    ];
    if bytes == 0 {
        return "0".to_string();
    }
    for (unit, suffix) in UNITS {
        if bytes % unit == 0 {
            return format!("{}{}", bytes / unit, suffix);
        }
    }
    bytes.to_string()
}

/// Human-friendly rendering for logs and event messages, e.g. `4.5Gi`.
pub fn display_size(bytes: u64) -> String {
    const UNITS: [(u64, &str); 4] = [(TI, "Ti"), (GI, "Gi"), (MI, "Mi"), (KI, "Ki")];
    for (unit, suffix) in UNITS {
        if bytes >= unit {
            let value = bytes as f64 / unit as f64;
            let rounded = (value * 100.0).round() / 100.0;
            return format!("{}{}", rounded, suffix);
        }
    }
    format!("{}B", bytes)
}

/// Round `bytes` up to the next multiple of `granularity`.
pub fn round_up(bytes: u64, granularity: u64) -> u64 {
    if granularity <= 1 {
        return bytes;
    }
    bytes.div_ceil(granularity).saturating_mul(granularity)
}

/// Parse a duration such as `30s`, `10m`, `24h` or `7d`.
pub fn parse_duration(input: &str) -> Result<Duration, PolicyError> {
    let invalid = || PolicyError::InvalidDuration(input.to_string());

    let s = input.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (number, unit) = s.split_at(split);
    let value: u64 = number.parse().map_err(|_| invalid())?;
    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3_600,
        "d" => value * 86_400,
        _ => return Err(invalid()),
    };
    if secs == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs(secs))
}
