use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};

/// mg/dL per mmol/L of glucose.
pub const MGDL_PER_MMOLL: f64 = 18.01559;

/// Decimal places kept for a canonical mmol/L glucose value.
const GLUCOSE_PRECISION: i32 = 5;

pub const WEEKDAYS: [&str; 7] = [
    "sunday",
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
];

/// Render a glucose value in canonical form: mmol/L at fixed precision.
///
/// Values ingested as mg/dL and values converted to mmol/L before ingestion
/// render identically, so floating point noise from either conversion never
/// reaches the fingerprint.
pub fn canonical_glucose(value: f64, units: &str) -> Result<String, String> {
    let mmoll = match units {
        "mmol/L" | "mmol/l" => value,
        "mg/dL" | "mg/dl" => value / MGDL_PER_MMOLL,
        other => return Err(format!("unsupported units '{}'", other)),
    };

    if !mmoll.is_finite() {
        return Err(format!("value {} is not finite", value));
    }

    let scale = 10f64.powi(GLUCOSE_PRECISION);
    // Adding 0.0 folds -0.0 into 0.0
    let rounded = (mmoll * scale).round() / scale + 0.0;
    Ok(format!("{:.*}", GLUCOSE_PRECISION as usize, rounded))
}

/// Magnitude below which every whole number is exact in an `f64`.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Render a JSON number independently of how it was written: `1`, `1.0` and
/// `1e0` all render as `1`. Fractional values use the shortest form that
/// round-trips.
pub fn canonical_number(number: &Number) -> String {
    if let Some(i) = number.as_i64() {
        return i.to_string();
    }
    if let Some(u) = number.as_u64() {
        return u.to_string();
    }
    match number.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < MAX_EXACT_INTEGER => (f as i64).to_string(),
        Some(f) => f.to_string(),
        None => number.to_string(),
    }
}

/// Render an RFC 3339 timestamp in UTC with millisecond precision.
pub fn canonical_time(value: &str) -> Result<String, String> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Millis, true))
        .map_err(|e| e.to_string())
}

/// Lower-case, de-duplicate and week-order a list of day names.
///
/// Returns the offending raw value when an entry is not a recognised day.
pub fn normalize_days(days: &[Value]) -> Result<Vec<Value>, String> {
    let mut indices = Vec::with_capacity(days.len());
    for day in days {
        let name = day.as_str().ok_or_else(|| day.to_string())?;
        let lower = name.trim().to_ascii_lowercase();
        let index = WEEKDAYS
            .iter()
            .position(|weekday| *weekday == lower)
            .ok_or_else(|| name.to_string())?;
        indices.push(index);
    }

    indices.sort_unstable();
    indices.dedup();

    Ok(indices
        .into_iter()
        .map(|i| Value::String(WEEKDAYS[i].to_string()))
        .collect())
}
