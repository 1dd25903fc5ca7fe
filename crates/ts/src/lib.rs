//! MPEG-2 Transport Stream (TS) packet layer and PSI/SI tooling.
//!
//! This crate provides the byte-level TS packet type, the MPEG-2 CRC-32,
//! a section demultiplexer that rebuilds PSI sections and tables from TS
//! packets on a per-PID basis, parsers for the tables a scrambler needs
//! (PAT, PMT, SDT) together with their descriptors, and packetizers that
//! turn sections back into TS packets.

pub mod crc32;
pub mod demux;
pub mod error;
pub mod packet;
pub mod packetizer;
pub mod pid;
pub mod psi;
pub mod section;
pub mod table;

pub use crc32::{mpeg2_crc32, validate_section_crc32};
pub use demux::{DemuxControl, DemuxHandler, DemuxStatus, SectionDemux};
pub use error::TsError;
pub use packet::{PKT_SIZE, SC_CLEAR, SC_EVEN_KEY, SC_ODD_KEY, SYNC_BYTE, TsPacket};
pub use packetizer::{CyclingPacketizer, OneShotPacketizer};
pub use pid::{PID_CAT, PID_MAX, PID_NULL, PID_PAT, PID_SDT, PidSet};
pub use section::{
    Etid, MAX_PRIVATE_SECTION_SIZE, MIN_LONG_SECTION_SIZE, MIN_SHORT_SECTION_SIZE, Section,
};
pub use table::BinaryTable;

/// Result type for TS parsing operations
pub type Result<T> = std::result::Result<T, TsError>;
