use super::meter_definitions::describe;
use super::normalizer::scaled_value;
use super::structs::DecodedRecord;
use super::utils::{format_sml_value, get_sml_unit_name, UNIT_WATT_HOUR};

/// One human readable line per record, e.g.
/// `1-0:1.8.0*255  Total consumption  = 12.346 kWh`.
pub fn format_record(record: &DecodedRecord) -> String {
    match record {
        DecodedRecord::Numeric(field) => {
            let unit = match field.unit {
                Some(UNIT_WATT_HOUR) => "kWh".to_string(),
                Some(code) => get_sml_unit_name(code).map(str::to_string).unwrap_or_else(|| format!("unit {code}")),
                None => String::new(),
            };
            let line = format!("{:<16} {:<24} = {} {}", field.obis.to_string(), label(record), scaled_value(field), unit);
            line.trim_end().to_string()
        }
        DecodedRecord::NonNumeric { obis, kind, value } => {
            format!("{:<16} {:<24} = {} ({})", obis.to_string(), label(record), format_sml_value(value), kind)
        }
        DecodedRecord::Malformed { obis, error } => {
            let code = obis.map(|o| o.to_string()).unwrap_or_else(|| "?".to_string());
            format!("{:<16} {:<24} ! {} error: {}", code, label(record), error.kind(), error)
        }
    }
}

fn label(record: &DecodedRecord) -> &'static str {
    let obis = match record {
        DecodedRecord::Numeric(field) => Some(field.obis),
        DecodedRecord::NonNumeric { obis, .. } => Some(*obis),
        DecodedRecord::Malformed { obis, .. } => *obis,
    };
    obis.as_ref().and_then(describe).unwrap_or("")
}

/// Formats records ordered by OBIS code, records without a code last.
pub fn format_records(records: &mut [DecodedRecord]) -> Vec<String> {
    records.sort_by_key(|record| match record {
        DecodedRecord::Numeric(field) => (false, Some(field.obis)),
        DecodedRecord::NonNumeric { obis, .. } => (false, Some(*obis)),
        DecodedRecord::Malformed { obis, .. } => (obis.is_none(), *obis),
    });
    records.iter().map(format_record).collect()
}
