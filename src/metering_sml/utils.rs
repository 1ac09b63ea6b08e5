use crc16::{State, X_25};

use super::structs::*;

pub const SML_ESCAPE: [u8; 4] = [0x1B, 0x1B, 0x1B, 0x1B];
pub const SML_VERSION_1: [u8; 4] = [0x01, 0x01, 0x01, 0x01];
pub const SML_END_MARKER: u8 = 0x1A;

/// DLMS unit code for watt hours
pub const UNIT_WATT_HOUR: u8 = 30;

/// CRC-16/X.25 as used by the SML transport layer.
pub fn calculate_crc16(data: &[u8]) -> u16 {
    State::<X_25>::calculate(data)
}

/// Checks the trailing CRC of a complete frame. The CRC covers everything
/// before it and is transmitted low byte first.
pub fn verify_frame_crc(frame: &[u8]) -> Result<(), super::ProtocolError> {
    if frame.len() < 16 {
        return Err(super::ProtocolError::TruncatedFrame(frame.len()));
    }
    let crc_pos = frame.len() - 2;
    let expected = u16::from_le_bytes([frame[crc_pos], frame[crc_pos + 1]]);
    let calculated = calculate_crc16(&frame[..crc_pos]);

    if expected != calculated {
        return Err(super::ProtocolError::ChecksumMismatch { expected, calculated });
    }
    Ok(())
}

/// Reverts the escaping of the transport layer: inside a frame a literal
/// escape sequence is sent twice.
pub fn unescape_payload(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    let mut i = 0;
    while i < payload.len() {
        if i % 4 == 0
            && payload.len() >= i + 8
            && payload[i..i + 4] == SML_ESCAPE
            && payload[i + 4..i + 8] == SML_ESCAPE
        {
            out.extend_from_slice(&SML_ESCAPE);
            i += 8;
        } else {
            out.push(payload[i]);
            i += 1;
        }
    }
    out
}

/// Renders a non numeric value for humans. Printable octet strings are shown
/// as text, everything else as hex.
pub fn format_sml_value(value: &SmlNode) -> String {
    match value {
        SmlNode::Absent => String::new(),
        SmlNode::Bool(b) => b.to_string(),
        SmlNode::Int(i) => i.to_string(),
        SmlNode::UInt(u) => u.to_string(),
        SmlNode::OctetString(bytes) => {
            if is_printable(bytes) {
                String::from_utf8_lossy(bytes).into_owned()
            } else {
                hex::encode(bytes)
            }
        }
        SmlNode::List(values) => {
            let formatted: Vec<String> = values.iter().map(format_sml_value).collect();
            format!("[{}]", formatted.join(", "))
        }
        SmlNode::EndOfMessage => "<eom>".to_string(),
    }
}

pub fn is_printable(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bytes.iter().all(|c| c.is_ascii_graphic() || *c == b' ')
}

// Unit names from the DLMS/COSEM unit table (IEC 62056-62)
pub fn get_sml_unit_name(unit_code: u8) -> Option<&'static str> {
    match unit_code {
        1 => Some("a"),        // year
        2 => Some("mo"),       // month
        3 => Some("wk"),       // week
        4 => Some("d"),        // day
        5 => Some("h"),        // hour
        6 => Some("min"),      // minute
        7 => Some("s"),        // second
        8 => Some("°"),        // degree
        9 => Some("°C"),       // degree celsius
        10 => Some("currency"),
        11 => Some("m"),       // meter
        12 => Some("m/s"),
        13 => Some("m³"),
        14 => Some("m³"),      // corrected volume
        15 => Some("m³/h"),
        16 => Some("m³/h"),    // corrected volume flux
        17 => Some("m³/d"),
        18 => Some("m³/d"),    // corrected volume flux
        19 => Some("l"),       // liter
        20 => Some("kg"),
        21 => Some("N"),
        22 => Some("Nm"),
        23 => Some("Pa"),
        24 => Some("bar"),
        25 => Some("J"),
        26 => Some("J/h"),
        27 => Some("W"),       // watt
        28 => Some("VA"),
        29 => Some("var"),
        30 => Some("Wh"),      // watt hour
        31 => Some("VAh"),
        32 => Some("varh"),
        33 => Some("A"),       // ampere
        34 => Some("C"),       // coulomb
        35 => Some("V"),       // volt
        36 => Some("V/m"),
        37 => Some("F"),
        38 => Some("Ω"),
        39 => Some("Ωm²/m"),
        40 => Some("Wb"),
        41 => Some("T"),
        42 => Some("A/m"),
        43 => Some("H"),
        44 => Some("Hz"),      // hertz
        45 => Some("1/(Wh)"),
        46 => Some("1/(varh)"),
        47 => Some("1/(VAh)"),
        48 => Some("V²h"),
        49 => Some("A²h"),
        50 => Some("kg/s"),
        51 => Some("S"),
        52 => Some("K"),       // kelvin
        56 => Some("%"),
        57 => Some("Ah"),
        255 => Some(""),       // count, no unit
        _ => None,
    }
}
