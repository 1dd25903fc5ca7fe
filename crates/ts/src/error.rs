use thiserror::Error;

/// Errors raised by the TS packet and section layer.
#[derive(Error, Debug)]
pub enum TsError {
    #[error("invalid TS packet size: {0} bytes (expected 188)")]
    InvalidPacketSize(usize),

    #[error("invalid sync byte: {0:#04x} (expected 0x47)")]
    InvalidSyncByte(u8),

    #[error("insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("invalid section length: {0}")]
    InvalidSectionLength(usize),

    #[error("invalid table id: expected {expected:#04x}, got {actual:#04x}")]
    InvalidTableId { expected: u8, actual: u8 },

    #[error("CRC-32 mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    Crc32Mismatch { stored: u32, computed: u32 },

    #[error("inconsistent table section: {0}")]
    InconsistentTable(String),

    #[error("descriptor too large: {0} bytes")]
    DescriptorTooLarge(usize),

    #[error("section payload does not fit: {0} bytes")]
    SectionOverflow(usize),

    #[error("parse error: {0}")]
    ParseError(String),
}
