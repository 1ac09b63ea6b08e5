use super::meter_definitions;
use super::structs::DecodedField;
use super::utils::UNIT_WATT_HOUR;
use crate::models::Metrics;
use log::trace;

/// Number of decimals every published value is rounded to.
pub const DECIMALS: i32 = 3;

/// Turns decoded fields into named metrics.
///
/// Only codes from the registry are kept. The value is `raw * 10^scaler`,
/// watt hours are converted to kilowatt hours, and the result is rounded to
/// three decimals, ties away from zero. If two fields map to the same metric
/// the later one wins.
pub fn normalize<'a, I>(fields: I) -> Metrics
where
    I: IntoIterator<Item = &'a DecodedField>,
{
    let mut metrics = Metrics::new();

    for field in fields {
        let Some(entry) = meter_definitions::lookup(&field.obis) else {
            trace!("{} is not in the registry, skipping", field.obis);
            continue;
        };
        metrics.insert(entry.metric.to_string(), scaled_value(field));
    }

    metrics
}

/// Scaled and rounded value of a single field.
pub fn scaled_value(field: &DecodedField) -> f64 {
    let mut exponent = field.scaler as i32;
    if field.unit == Some(UNIT_WATT_HOUR) {
        exponent -= 3;
    }
    round_scaled(field.raw, exponent)
}

/// Rounds `raw * 10^exponent` to [`DECIMALS`] places.
///
/// The rounding happens on the exact decimal in integer arithmetic, so a tie
/// like 12.3455 really is a tie and goes away from zero to 12.346.
pub fn round_scaled(raw: i64, exponent: i32) -> f64 {
    let shift = exponent + DECIMALS;
    let divisor = 10f64.powi(DECIMALS);

    let thousandths = if shift >= 0 {
        10i128
            .checked_pow(shift as u32)
            .and_then(|factor| (raw as i128).checked_mul(factor))
    } else {
        10i128
            .checked_pow(shift.unsigned_abs())
            .map(|factor| div_round_half_away(raw as i128, factor))
            .or(Some(0))
    };

    match thousandths {
        Some(t) => t as f64 / divisor,
        None => (raw as f64 * 10f64.powi(exponent) * divisor).round() / divisor,
    }
}

fn div_round_half_away(value: i128, divisor: i128) -> i128 {
    let quotient = value / divisor;
    let remainder = (value % divisor).abs();
    if remainder * 2 >= divisor {
        quotient + value.signum()
    } else {
        quotient
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::structs::ObisCode;

    const TOTAL: ObisCode = ObisCode::new(1, 0, 1, 8, 0, 255);
    const POWER: ObisCode = ObisCode::new(1, 0, 16, 7, 0, 255);
    const TARIFF_1: ObisCode = ObisCode::new(1, 0, 1, 8, 1, 255);

    fn field(obis: ObisCode, raw: i64, scaler: i8, unit: Option<u8>) -> DecodedField {
        DecodedField { obis, raw, scaler, unit }
    }

    #[test]
    fn test_watt_hours_become_kilowatt_hours() {
        let metrics = normalize(&[field(TOTAL, 123_456, -1, Some(UNIT_WATT_HOUR))]);
        assert_eq!(metrics.get("total_kwh"), Some(&12.346));
    }

    #[test]
    fn test_scale_zero_watt_hours() {
        for raw in [0i64, 1, 999, 1_000, 1_234_567, 98_765_432_109] {
            let metrics = normalize(&[field(TOTAL, raw, 0, Some(UNIT_WATT_HOUR))]);
            assert_eq!(metrics["total_kwh"], raw as f64 / 1000.0, "raw {raw}");
        }
    }

    #[test]
    fn test_ties_round_away_from_zero() {
        assert_eq!(round_scaled(123_455, -4), 12.346);
        assert_eq!(round_scaled(-123_455, -4), -12.346);
        assert_eq!(round_scaled(123_454, -4), 12.345);
        assert_eq!(round_scaled(5, -4), 0.001);
        assert_eq!(round_scaled(4, -4), 0.0);
    }

    #[test]
    fn test_positive_scaler() {
        let metrics = normalize(&[field(POWER, 25, 2, Some(27))]);
        assert_eq!(metrics["power_w"], 2500.0);
    }

    #[test]
    fn test_other_units_are_not_converted() {
        let metrics = normalize(&[field(POWER, -1234, -1, Some(27))]);
        assert_eq!(metrics["power_w"], -123.4);
    }

    #[test]
    fn test_unknown_codes_are_skipped() {
        let fields = [
            field(TARIFF_1, 1, 0, Some(UNIT_WATT_HOUR)),
            field(POWER, 100, 0, Some(27)),
        ];
        let metrics = normalize(&fields);
        assert_eq!(metrics.len(), 1);
        assert!(metrics.contains_key("power_w"));
    }

    #[test]
    fn test_last_write_wins() {
        let fields = [field(POWER, 1, 0, Some(27)), field(POWER, 2, 0, Some(27))];
        assert_eq!(normalize(&fields)["power_w"], 2.0);
    }

    #[test]
    fn test_normalize_is_repeatable() {
        let fields = vec![
            field(TOTAL, 987_654_321, -1, Some(UNIT_WATT_HOUR)),
            field(POWER, 4321, -2, Some(27)),
        ];
        assert_eq!(normalize(&fields), normalize(&fields));
    }

    #[test]
    fn test_huge_exponent_falls_back_to_float() {
        let big = round_scaled(1, 40);
        assert!(((big - 1e40) / 1e40).abs() < 1e-12);
        assert_eq!(round_scaled(i64::MAX, -60), 0.0);
    }
}
