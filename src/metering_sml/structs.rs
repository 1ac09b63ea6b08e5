use std::fmt;

use super::ProtocolError;

// SML-specific OBIS code format (6 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObisCode {
    pub medium: u8,      // 0: abstract, 1: electricity, etc.
    pub channel: u8,     // 0-255
    pub indicator: u8,   // Physical value indicator
    pub mode: u8,        // Processing method
    pub tariff: u8,      // Tariff/time
    pub previous: u8,    // Historical value indicator
}

impl ObisCode {
    pub const fn new(medium: u8, channel: u8, indicator: u8, mode: u8, tariff: u8, previous: u8) -> Self {
        ObisCode { medium, channel, indicator, mode, tariff, previous }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == 6 {
            Some(ObisCode::new(bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]))
        } else {
            None
        }
    }
}

impl fmt::Display for ObisCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}:{}.{}.{}*{}",
            self.medium, self.channel,
            self.indicator, self.mode,
            self.tariff, self.previous)
    }
}

/// One node of the SML type-length-value tree.
#[derive(Debug, Clone, PartialEq)]
pub enum SmlNode {
    /// `0x01`, used for optional fields that are not present
    Absent,
    OctetString(Vec<u8>),
    Bool(bool),
    Int(i64),
    UInt(u64),
    List(Vec<SmlNode>),
    EndOfMessage,
}

impl SmlNode {
    pub fn as_list(&self) -> Option<&[SmlNode]> {
        match self {
            SmlNode::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            SmlNode::OctetString(bytes) => Some(bytes),
            SmlNode::Absent => Some(&[]),
            _ => None,
        }
    }

    pub fn as_unsigned(&self) -> Option<u64> {
        match self {
            SmlNode::UInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            SmlNode::Absent => "absent",
            SmlNode::OctetString(_) => "octet string",
            SmlNode::Bool(_) => "boolean",
            SmlNode::Int(_) => "signed integer",
            SmlNode::UInt(_) => "unsigned integer",
            SmlNode::List(_) => "list",
            SmlNode::EndOfMessage => "end of message",
        }
    }
}

// SML Protocol Data Structures

#[derive(Debug, Clone)]
pub struct SmlMessage {
    pub transaction_id: Vec<u8>,
    pub message_body: SmlMessageBody,
}

#[derive(Debug, Clone)]
pub enum SmlMessageBody {
    OpenResponse,
    CloseResponse,
    GetListResponse(SmlGetListResponse),
}

#[derive(Debug, Clone)]
pub struct SmlGetListResponse {
    pub server_id: Option<Vec<u8>>,
    pub val_list: Vec<SmlNode>,
}

/// A numeric list entry, ready to be normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedField {
    pub obis: ObisCode,
    pub raw: i64,
    pub scaler: i8,
    pub unit: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonNumericKind {
    Text,
    Bytes,
    Bool,
    List,
    Absent,
}

impl fmt::Display for NonNumericKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NonNumericKind::Text => "text",
            NonNumericKind::Bytes => "bytes",
            NonNumericKind::Bool => "boolean",
            NonNumericKind::List => "list",
            NonNumericKind::Absent => "absent",
        };
        f.write_str(name)
    }
}

/// Classification of one `valList` entry, decided once by the decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedRecord {
    Numeric(DecodedField),
    NonNumeric { obis: ObisCode, kind: NonNumericKind, value: SmlNode },
    Malformed { obis: Option<ObisCode>, error: ProtocolError },
}

impl DecodedRecord {
    pub fn as_numeric(&self) -> Option<&DecodedField> {
        match self {
            DecodedRecord::Numeric(field) => Some(field),
            _ => None,
        }
    }
}
