use super::structs::ObisCode;

/// A quantity that gets published as a metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistryEntry {
    pub obis: ObisCode,
    pub metric: &'static str,
    pub unit: &'static str,
    pub label: &'static str,
}

const fn entry(obis: ObisCode, metric: &'static str, unit: &'static str, label: &'static str) -> RegistryEntry {
    RegistryEntry { obis, metric, unit, label }
}

// Values published by the Iskra SBZ17 in the meter cabinet. The per phase
// power codes are what this meter uses, not the usual 21/41/61.7.0.
pub static REGISTRY: [RegistryEntry; 6] = [
    entry(ObisCode::new(1, 0, 1, 8, 0, 255), "total_kwh", "kWh", "Total consumption"),
    entry(ObisCode::new(1, 0, 2, 8, 0, 255), "total_export_kwh", "kWh", "Feed-in"),
    entry(ObisCode::new(1, 0, 16, 7, 0, 255), "power_w", "W", "Current power"),
    entry(ObisCode::new(1, 0, 36, 7, 0, 255), "power_l1_w", "W", "Power L1"),
    entry(ObisCode::new(1, 0, 56, 7, 0, 255), "power_l2_w", "W", "Power L2"),
    entry(ObisCode::new(1, 0, 76, 7, 0, 255), "power_l3_w", "W", "Power L3"),
];

pub fn lookup(obis: &ObisCode) -> Option<&'static RegistryEntry> {
    REGISTRY.iter().find(|e| e.obis == *obis)
}

/// Human readable label for any code the meter sends, published or not.
pub fn describe(obis: &ObisCode) -> Option<&'static str> {
    if let Some(entry) = lookup(obis) {
        return Some(entry.label);
    }

    match (obis.medium, obis.channel, obis.indicator, obis.mode, obis.tariff, obis.previous) {
        (1, 0, 96, 50, 1, 1) => Some("Manufacturer"),
        (1, 0, 96, 1, 0, 255) => Some("Meter ID"),
        (1, 0, 0, 0, 9, 255) => Some("Device ID"),
        (1, 0, 1, 8, 1, 255) => Some("Consumption tariff 1"),
        (1, 0, 1, 8, 2, 255) => Some("Consumption tariff 2"),
        (1, 0, 96, 5, 0, 255) => Some("Status word"),
        _ => None,
    }
}
