//! Builders for SML frames used by the unit tests.

use super::structs::ObisCode;
use super::utils::{calculate_crc16, SML_ESCAPE, SML_END_MARKER, SML_VERSION_1};

pub fn octet(bytes: &[u8]) -> Vec<u8> {
    let total = bytes.len() + 1;
    let mut out = if total < 16 {
        vec![total as u8]
    } else {
        let total = total + 1;
        vec![0x80 | ((total >> 4) as u8 & 0x0F), (total & 0x0F) as u8]
    };
    out.extend_from_slice(bytes);
    out
}

pub fn uint(value: u64, len: usize) -> Vec<u8> {
    let mut out = vec![0x60 | (len as u8 + 1)];
    out.extend_from_slice(&value.to_be_bytes()[8 - len..]);
    out
}

pub fn int(value: i64, len: usize) -> Vec<u8> {
    let mut out = vec![0x50 | (len as u8 + 1)];
    out.extend_from_slice(&value.to_be_bytes()[8 - len..]);
    out
}

pub fn list(count: usize) -> Vec<u8> {
    vec![0x70 | count as u8]
}

pub fn absent() -> Vec<u8> {
    vec![0x01]
}

fn obis_bytes(obis: ObisCode) -> [u8; 6] {
    [obis.medium, obis.channel, obis.indicator, obis.mode, obis.tariff, obis.previous]
}

/// A `valList` entry with an arbitrary encoded value.
pub fn entry(obis: ObisCode, unit: Option<u8>, scaler: Option<i8>, value: Vec<u8>) -> Vec<u8> {
    let mut out = list(7);
    out.extend(octet(&obis_bytes(obis)));
    out.extend(absent()); // status
    out.extend(absent()); // valTime
    out.extend(unit.map(|u| uint(u as u64, 1)).unwrap_or_else(absent));
    out.extend(scaler.map(|s| int(s as i64, 1)).unwrap_or_else(absent));
    out.extend(value);
    out.extend(absent()); // valueSignature
    out
}

pub fn signed_entry(obis: ObisCode, unit: u8, scaler: i8, raw: i64) -> Vec<u8> {
    entry(obis, Some(unit), Some(scaler), int(raw, 8))
}

fn message(tag: u16, body: Vec<u8>) -> Vec<u8> {
    let mut out = list(6);
    out.extend(octet(&[0x00, 0x01, 0x02]));
    out.extend(uint(0, 1));
    out.extend(uint(0, 1));
    out.extend(list(2));
    out.extend(uint(tag as u64, 2));
    out.extend(body);
    let crc = calculate_crc16(&out);
    out.extend(uint(crc as u64, 2));
    out.push(0x00);
    out
}

pub fn open_response() -> Vec<u8> {
    let mut body = list(6);
    body.extend(absent());
    body.extend(absent());
    body.extend(octet(&[0x11, 0x22]));
    body.extend(octet(&[0x0A, 0x01, 0x49, 0x53, 0x4B]));
    body.extend(absent());
    body.extend(absent());
    message(0x0101, body)
}

pub fn close_response() -> Vec<u8> {
    let mut body = list(1);
    body.extend(absent());
    message(0x0201, body)
}

pub fn get_list_response(entries: &[Vec<u8>]) -> Vec<u8> {
    let mut body = list(7);
    body.extend(absent());
    body.extend(octet(&[0x0A, 0x01, 0x49, 0x53, 0x4B]));
    body.extend(octet(&[0x01, 0x00, 0x62, 0x0A, 0xFF, 0xFF]));
    body.extend(list(2));
    body.extend(uint(1, 1));
    body.extend(uint(1_700_000_000, 4));
    body.extend(list(entries.len()));
    for e in entries {
        body.extend_from_slice(e);
    }
    body.extend(absent());
    body.extend(absent());
    message(0x0701, body)
}

pub fn frame_from_payload(payload: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(payload.len() + 8);
    for chunk in payload.chunks(4) {
        if chunk == SML_ESCAPE {
            escaped.extend_from_slice(&SML_ESCAPE);
        }
        escaped.extend_from_slice(chunk);
    }
    let padding = (4 - escaped.len() % 4) % 4;
    escaped.extend(std::iter::repeat(0x00).take(padding));

    let mut frame = Vec::new();
    frame.extend_from_slice(&SML_ESCAPE);
    frame.extend_from_slice(&SML_VERSION_1);
    frame.extend(escaped);
    frame.extend_from_slice(&SML_ESCAPE);
    frame.push(SML_END_MARKER);
    frame.push(padding as u8);
    let crc = calculate_crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Open, GetList and Close response in one frame, the way meters send them.
pub fn meter_frame(entries: &[Vec<u8>]) -> Vec<u8> {
    let mut payload = open_response();
    payload.extend(get_list_response(entries));
    payload.extend(close_response());
    frame_from_payload(&payload)
}
