use super::structs::*;
use super::utils::*;
use super::ProtocolError;
use log::{debug, trace};

// SML Message Type constants
const SML_OPEN_RESPONSE: u32 = 0x0101;
const SML_CLOSE_RESPONSE: u32 = 0x0201;
const SML_GET_LIST_RESPONSE: u32 = 0x0701;

// TL type nibbles
const TYPE_OCTET_STRING: u8 = 0;
const TYPE_BOOL: u8 = 4;
const TYPE_SIGNED: u8 = 5;
const TYPE_UNSIGNED: u8 = 6;
const TYPE_LIST: u8 = 7;

const MAX_DEPTH: usize = 16;
const MAX_TL_BYTES: usize = 4;

/// Decodes one complete frame (as returned by the frame assembler) into
/// classified list entries.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<DecodedRecord>, ProtocolError> {
    let messages = parse_sml_frame(frame)?;
    let mut records = Vec::new();

    for message in messages {
        if let SmlMessageBody::GetListResponse(response) = message.message_body {
            debug!("GetList response (transaction {}) from server {} with {} entries",
                hex::encode(&message.transaction_id),
                response.server_id.as_deref().map(hex::encode).unwrap_or_else(|| "unknown".to_string()),
                response.val_list.len());
            records.extend(response.val_list.iter().map(classify_entry));
        }
    }

    Ok(records)
}

/// Checks the transport envelope of a frame and parses all messages inside.
pub fn parse_sml_frame(frame: &[u8]) -> Result<Vec<SmlMessage>, ProtocolError> {
    if frame.len() < 16 {
        return Err(ProtocolError::TruncatedFrame(frame.len()));
    }
    if frame[0..4] != SML_ESCAPE || frame[4..8] != SML_VERSION_1 {
        return Err(ProtocolError::MissingStartSequence);
    }
    let end = frame.len() - 8;
    if frame[end..end + 4] != SML_ESCAPE || frame[end + 4] != SML_END_MARKER {
        return Err(ProtocolError::MissingEndSequence);
    }
    verify_frame_crc(frame)?;

    let padding = frame[end + 5] as usize;
    let payload = unescape_payload(&frame[8..end]);
    if padding > 3 || padding > payload.len() {
        return Err(ProtocolError::InvalidLength { kind: "padding", length: padding });
    }
    let payload = &payload[..payload.len() - padding];

    let mut parser = SmlParser::new(payload);
    let messages = parser.parse_sml_file()?;
    debug!("Parsed {} SML messages from {} byte frame", messages.len(), frame.len());
    Ok(messages)
}

pub(crate) struct SmlParser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SmlParser<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn parse_sml_file(&mut self) -> Result<Vec<SmlMessage>, ProtocolError> {
        let mut messages = Vec::new();

        // Trailing zero bytes are fill, not messages
        while self.pos < self.data.len() && self.data[self.pos] != 0x00 {
            let node = self.parse_node(0)?;
            messages.push(read_message(&node)?);
        }

        if messages.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }

        Ok(messages)
    }

    fn next_byte(&mut self) -> Result<u8, ProtocolError> {
        let byte = *self.data.get(self.pos).ok_or(ProtocolError::UnexpectedEnd(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], ProtocolError> {
        if self.pos + count > self.data.len() {
            return Err(ProtocolError::UnexpectedEnd(self.data.len()));
        }
        let bytes = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(bytes)
    }

    /// Returns (type, length, number of TL bytes).
    pub(crate) fn parse_type_length(&mut self) -> Result<(u8, usize, usize), ProtocolError> {
        let first_byte = self.next_byte()?;

        let type_field = (first_byte >> 4) & 0x07;
        let mut length = (first_byte & 0x0F) as usize;
        let mut more = first_byte & 0x80 != 0;
        let mut tl_bytes = 1;

        while more {
            if tl_bytes == MAX_TL_BYTES {
                return Err(ProtocolError::InvalidLength { kind: "type-length field", length: tl_bytes + 1 });
            }
            let next = self.next_byte()?;
            if (next >> 4) & 0x07 != 0 {
                return Err(ProtocolError::UnknownType(next));
            }
            length = (length << 4) | (next & 0x0F) as usize;
            more = next & 0x80 != 0;
            tl_bytes += 1;
        }

        Ok((type_field, length, tl_bytes))
    }

    pub(crate) fn parse_node(&mut self, depth: usize) -> Result<SmlNode, ProtocolError> {
        if depth > MAX_DEPTH {
            return Err(ProtocolError::NestingTooDeep(MAX_DEPTH));
        }
        if self.data.get(self.pos) == Some(&0x00) {
            self.pos += 1;
            return Ok(SmlNode::EndOfMessage);
        }

        let offset = self.pos;
        let (type_field, length, tl_bytes) = self.parse_type_length()?;
        trace!("TL at {offset}: type {type_field} length {length}");

        if type_field == TYPE_LIST {
            let mut items = Vec::with_capacity(length.min(64));
            for _ in 0..length {
                items.push(self.parse_node(depth + 1)?);
            }
            return Ok(SmlNode::List(items));
        }

        if length < tl_bytes {
            return Err(ProtocolError::InvalidLength { kind: "scalar", length });
        }
        let size = length - tl_bytes;

        match type_field {
            TYPE_OCTET_STRING => {
                if size == 0 {
                    return Ok(SmlNode::Absent);
                }
                Ok(SmlNode::OctetString(self.take(size)?.to_vec()))
            }
            TYPE_BOOL => {
                if size != 1 {
                    return Err(ProtocolError::InvalidLength { kind: "boolean", length: size });
                }
                Ok(SmlNode::Bool(self.take(1)?[0] != 0))
            }
            TYPE_SIGNED => {
                if size == 0 || size > 8 {
                    return Err(ProtocolError::InvalidLength { kind: "signed integer", length: size });
                }
                let bytes = self.take(size)?;
                // Sign extend from the most significant byte
                let mut value: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
                for b in bytes {
                    value = (value << 8) | *b as i64;
                }
                Ok(SmlNode::Int(value))
            }
            TYPE_UNSIGNED => {
                if size == 0 || size > 8 {
                    return Err(ProtocolError::InvalidLength { kind: "unsigned integer", length: size });
                }
                let value = self.take(size)?.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
                Ok(SmlNode::UInt(value))
            }
            _ => Err(ProtocolError::UnknownType(self.data[offset])),
        }
    }
}

fn expect_list(node: &SmlNode, expected: usize) -> Result<&[SmlNode], ProtocolError> {
    let items = node.as_list().ok_or(ProtocolError::UnexpectedType { expected: "list", found: node.type_name() })?;
    if items.len() != expected {
        return Err(ProtocolError::BadListLength { expected, found: items.len() });
    }
    Ok(items)
}

fn optional_bytes(node: &SmlNode) -> Result<Option<Vec<u8>>, ProtocolError> {
    match node {
        SmlNode::Absent => Ok(None),
        SmlNode::OctetString(bytes) => Ok(Some(bytes.clone())),
        other => Err(ProtocolError::UnexpectedType { expected: "octet string", found: other.type_name() }),
    }
}

fn small_unsigned(node: &SmlNode) -> Result<u8, ProtocolError> {
    match node {
        SmlNode::UInt(v) if *v <= u8::MAX as u64 => Ok(*v as u8),
        other => Err(ProtocolError::UnexpectedType { expected: "unsigned8", found: other.type_name() }),
    }
}

fn read_message(node: &SmlNode) -> Result<SmlMessage, ProtocolError> {
    let items = expect_list(node, 6)?;

    let transaction_id = optional_bytes(&items[0])?.unwrap_or_default();
    small_unsigned(&items[1])?; // groupNo
    small_unsigned(&items[2])?; // abortOnError

    let body = expect_list(&items[3], 2)?;
    let tag = body[0]
        .as_unsigned()
        .ok_or(ProtocolError::UnexpectedType { expected: "message tag", found: body[0].type_name() })?;
    let message_body = match u32::try_from(tag).map_err(|_| ProtocolError::UnsupportedMessageBody(tag))? {
        SML_OPEN_RESPONSE => SmlMessageBody::OpenResponse,
        SML_CLOSE_RESPONSE => SmlMessageBody::CloseResponse,
        SML_GET_LIST_RESPONSE => SmlMessageBody::GetListResponse(read_get_list_response(&body[1])?),
        _ => return Err(ProtocolError::UnsupportedMessageBody(tag)),
    };

    match &items[4] {
        SmlNode::Absent => {}
        SmlNode::UInt(v) if *v <= u16::MAX as u64 => {}
        other => return Err(ProtocolError::UnexpectedType { expected: "message CRC", found: other.type_name() }),
    }

    if items[5] != SmlNode::EndOfMessage {
        return Err(ProtocolError::MissingEndOfMessage);
    }

    Ok(SmlMessage { transaction_id, message_body })
}

fn read_get_list_response(node: &SmlNode) -> Result<SmlGetListResponse, ProtocolError> {
    let items = expect_list(node, 7)?;

    optional_bytes(&items[0])?; // clientId
    optional_bytes(&items[2])?; // listName
    let val_list = items[4]
        .as_list()
        .ok_or(ProtocolError::UnexpectedType { expected: "value list", found: items[4].type_name() })?
        .to_vec();

    Ok(SmlGetListResponse { server_id: optional_bytes(&items[1])?, val_list })
}

/// Decides what a single `valList` entry is. Errors in one entry do not
/// affect its neighbours.
pub fn classify_entry(node: &SmlNode) -> DecodedRecord {
    let items = match expect_list(node, 7) {
        Ok(items) => items,
        Err(error) => return DecodedRecord::Malformed { obis: None, error },
    };

    let obis = match items[0].as_bytes().and_then(ObisCode::from_bytes) {
        Some(obis) => obis,
        None => {
            let length = items[0].as_bytes().map(|b| b.len()).unwrap_or(0);
            return DecodedRecord::Malformed {
                obis: None,
                error: ProtocolError::InvalidLength { kind: "OBIS code", length },
            };
        }
    };

    let raw = match &items[5] {
        SmlNode::Int(v) => *v,
        SmlNode::UInt(v) => match i64::try_from(*v) {
            Ok(v) => v,
            Err(_) => return DecodedRecord::Malformed { obis: Some(obis), error: ProtocolError::IntegerOverflow(*v) },
        },
        SmlNode::OctetString(bytes) => {
            let kind = if is_printable(bytes) { NonNumericKind::Text } else { NonNumericKind::Bytes };
            return DecodedRecord::NonNumeric { obis, kind, value: items[5].clone() };
        }
        SmlNode::Bool(_) => return DecodedRecord::NonNumeric { obis, kind: NonNumericKind::Bool, value: items[5].clone() },
        SmlNode::List(_) => return DecodedRecord::NonNumeric { obis, kind: NonNumericKind::List, value: items[5].clone() },
        SmlNode::Absent => return DecodedRecord::NonNumeric { obis, kind: NonNumericKind::Absent, value: SmlNode::Absent },
        SmlNode::EndOfMessage => {
            return DecodedRecord::Malformed {
                obis: Some(obis),
                error: ProtocolError::UnexpectedType { expected: "value", found: "end of message" },
            }
        }
    };

    let unit = match &items[3] {
        SmlNode::Absent => None,
        SmlNode::UInt(v) if *v <= u8::MAX as u64 => Some(*v as u8),
        other => return DecodedRecord::Malformed { obis: Some(obis), error: ProtocolError::InvalidUnit(format_sml_value(other)) },
    };

    let scaler = match &items[4] {
        SmlNode::Absent => 0,
        SmlNode::Int(v) => match i8::try_from(*v) {
            Ok(s) => s,
            Err(_) => return DecodedRecord::Malformed { obis: Some(obis), error: ProtocolError::InvalidScaler(v.to_string()) },
        },
        other => return DecodedRecord::Malformed { obis: Some(obis), error: ProtocolError::InvalidScaler(format_sml_value(other)) },
    };

    DecodedRecord::Numeric(DecodedField { obis, raw, scaler, unit })
}
