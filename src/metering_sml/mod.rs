use crate::models::Metrics;
use log::{debug, warn};
use thiserror::Error;

pub mod structs;
pub mod frame;
pub mod parser;
pub mod utils;
pub mod meter_definitions;
pub mod normalizer;
pub mod report;

#[cfg(test)]
pub(crate) mod test_frames;

pub use frame::FrameAssembler;
pub use normalizer::normalize;
pub use parser::decode_frame;
pub use structs::{DecodedField, DecodedRecord, ObisCode};

/// Errors raised while decoding a frame.
///
/// Structural errors mean the frame (or entry) does not follow the SML
/// encoding, numeric errors mean a well formed entry carries a value that
/// can not be turned into a number.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame too short ({0} bytes)")]
    TruncatedFrame(usize),
    #[error("missing SML start sequence")]
    MissingStartSequence,
    #[error("missing SML end sequence")]
    MissingEndSequence,
    #[error("checksum mismatch: frame says 0x{expected:04X}, calculated 0x{calculated:04X}")]
    ChecksumMismatch { expected: u16, calculated: u16 },
    #[error("unexpected end of data at offset {0}")]
    UnexpectedEnd(usize),
    #[error("unknown type-length byte 0x{0:02X}")]
    UnknownType(u8),
    #[error("expected {expected}, found {found}")]
    UnexpectedType { expected: &'static str, found: &'static str },
    #[error("invalid length {length} for {kind}")]
    InvalidLength { kind: &'static str, length: usize },
    #[error("expected a list of {expected} elements, found {found}")]
    BadListLength { expected: usize, found: usize },
    #[error("nesting deeper than {0} levels")]
    NestingTooDeep(usize),
    #[error("message is not terminated by an end of message marker")]
    MissingEndOfMessage,
    #[error("unsupported message body 0x{0:04X}")]
    UnsupportedMessageBody(u64),
    #[error("frame contains no SML messages")]
    EmptyFrame,
    #[error("value {0} does not fit into a signed 64 bit integer")]
    IntegerOverflow(u64),
    #[error("invalid scaler {0}")]
    InvalidScaler(String),
    #[error("invalid unit {0}")]
    InvalidUnit(String),
}

impl ProtocolError {
    pub fn is_numeric(&self) -> bool {
        matches!(self,
            ProtocolError::IntegerOverflow(_) | ProtocolError::InvalidScaler(_) | ProtocolError::InvalidUnit(_))
    }

    pub fn kind(&self) -> &'static str {
        if self.is_numeric() { "numeric" } else { "structure" }
    }
}

/// What one drain of the assembler produced.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DrainSummary {
    pub metrics: Metrics,
    pub frames: usize,
    pub failed_frames: usize,
}

/// Decodes every complete frame currently buffered and merges their metrics,
/// later frames overwriting earlier ones. A broken frame is logged and
/// skipped, the remaining frames are still processed.
pub fn drain_metrics(assembler: &mut FrameAssembler) -> DrainSummary {
    let mut summary = DrainSummary::default();

    while let Some(frame) = assembler.next_frame() {
        summary.frames += 1;

        let records = match decode_frame(&frame) {
            Ok(records) => records,
            Err(e) => {
                warn!("Dropping SML frame ({} error): {}", e.kind(), e);
                summary.failed_frames += 1;
                continue;
            }
        };

        let mut fields = Vec::with_capacity(records.len());
        for record in records {
            match record {
                DecodedRecord::Numeric(field) => fields.push(field),
                DecodedRecord::NonNumeric { obis, kind, .. } => {
                    debug!("Skipping non numeric {} value for {}", kind, obis);
                }
                DecodedRecord::Malformed { obis, error } => {
                    let code = obis.map(|o| o.to_string()).unwrap_or_else(|| "unknown code".to_string());
                    warn!("Malformed entry for {} ({} error): {}", code, error.kind(), error);
                }
            }
        }

        summary.metrics.extend(normalize(&fields));
    }

    summary
}
