use std::collections::BTreeMap;

use crate::psi::descriptor::{DescriptorList, TAG_AC3, TAG_EAC3, TAG_SUBTITLING, TAG_TELETEXT};
use crate::section::{MAX_PSI_SECTION_SIZE, MIN_LONG_SECTION_SIZE, Section};
use crate::table::BinaryTable;
use crate::{Result, TsError};

/// Table id of the Program Map Table
pub const TID_PMT: u8 = 0x02;

/// MPEG-1 video
pub const ST_MPEG1_VIDEO: u8 = 0x01;
/// MPEG-2 video
pub const ST_MPEG2_VIDEO: u8 = 0x02;
/// MPEG-1 audio
pub const ST_MPEG1_AUDIO: u8 = 0x03;
/// MPEG-2 audio
pub const ST_MPEG2_AUDIO: u8 = 0x04;
/// Private PES data (DVB subtitles, teletext, AC-3 by descriptor)
pub const ST_PES_PRIVATE: u8 = 0x06;
/// AAC audio (ADTS)
pub const ST_AAC_AUDIO: u8 = 0x0F;
/// MPEG-4 video
pub const ST_MPEG4_VIDEO: u8 = 0x10;
/// AAC audio (LATM)
pub const ST_LATM_AUDIO: u8 = 0x11;
/// AVC / H.264 video
pub const ST_AVC_VIDEO: u8 = 0x1B;
/// HEVC / H.265 video
pub const ST_HEVC_VIDEO: u8 = 0x24;
/// ATSC AC-3 audio
pub const ST_AC3_AUDIO: u8 = 0x81;

/// One elementary stream of a PMT.
#[derive(Debug, Clone, Default)]
pub struct PmtStream {
    pub stream_type: u8,
    pub descriptors: DescriptorList,
}

impl PmtStream {
    pub fn new(stream_type: u8) -> Self {
        PmtStream {
            stream_type,
            descriptors: DescriptorList::new(),
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(
            self.stream_type,
            ST_MPEG1_VIDEO | ST_MPEG2_VIDEO | ST_MPEG4_VIDEO | ST_AVC_VIDEO | ST_HEVC_VIDEO
        )
    }

    pub fn is_audio(&self) -> bool {
        matches!(
            self.stream_type,
            ST_MPEG1_AUDIO | ST_MPEG2_AUDIO | ST_AAC_AUDIO | ST_LATM_AUDIO | ST_AC3_AUDIO
        ) || (self.stream_type == ST_PES_PRIVATE
            && (self.descriptors.contains(TAG_AC3) || self.descriptors.contains(TAG_EAC3)))
    }

    pub fn is_subtitles(&self) -> bool {
        self.stream_type == ST_PES_PRIVATE
            && (self.descriptors.contains(TAG_SUBTITLING)
                || self.descriptors.contains(TAG_TELETEXT))
    }
}

/// Program Map Table of one service.
#[derive(Debug, Clone, Default)]
pub struct Pmt {
    pub service_id: u16,
    pub version: u8,
    pub pcr_pid: u16,
    /// Program-level descriptor loop
    pub descriptors: DescriptorList,
    /// Elementary streams by PID
    pub streams: BTreeMap<u16, PmtStream>,
}

impl Pmt {
    /// Parse a PMT from a complete table.
    pub fn from_table(table: &BinaryTable) -> Result<Self> {
        if table.table_id() != TID_PMT {
            return Err(TsError::InvalidTableId {
                expected: TID_PMT,
                actual: table.table_id(),
            });
        }
        let mut pmt = Pmt {
            service_id: table.table_id_extension(),
            version: table.version(),
            ..Default::default()
        };
        for (index, sect) in table.sections().enumerate() {
            let payload = sect.payload();
            if payload.len() < 4 {
                return Err(TsError::InsufficientData {
                    expected: 4,
                    actual: payload.len(),
                });
            }
            let pcr_pid = u16::from_be_bytes([payload[0], payload[1]]) & 0x1FFF;
            if index == 0 {
                pmt.pcr_pid = pcr_pid;
            }
            let info_len = (u16::from_be_bytes([payload[2], payload[3]]) & 0x0FFF) as usize;
            let mut pos = 4;
            if payload.len() < pos + info_len {
                return Err(TsError::InsufficientData {
                    expected: pos + info_len,
                    actual: payload.len(),
                });
            }
            if index == 0 {
                pmt.descriptors = DescriptorList::from_slice(&payload[pos..pos + info_len]);
            }
            pos += info_len;

            while pos + 5 <= payload.len() {
                let stream_type = payload[pos];
                let pid = u16::from_be_bytes([payload[pos + 1], payload[pos + 2]]) & 0x1FFF;
                let es_len =
                    (u16::from_be_bytes([payload[pos + 3], payload[pos + 4]]) & 0x0FFF) as usize;
                pos += 5;
                if payload.len() < pos + es_len {
                    return Err(TsError::InsufficientData {
                        expected: pos + es_len,
                        actual: payload.len(),
                    });
                }
                let mut stream = PmtStream::new(stream_type);
                stream.descriptors = DescriptorList::from_slice(&payload[pos..pos + es_len]);
                pmt.streams.insert(pid, stream);
                pos += es_len;
            }
        }
        Ok(pmt)
    }

    /// Serialize into a single section. A PMT that outgrows one section is
    /// refused; the tables this library rebuilds (a PMT plus a handful of
    /// CA descriptors) always fit.
    pub fn to_section(&self) -> Result<Section> {
        let mut payload = Vec::with_capacity(64);
        payload.extend_from_slice(&(0xE000 | (self.pcr_pid & 0x1FFF)).to_be_bytes());
        payload.extend_from_slice(&(0xF000 | self.descriptors.size() as u16).to_be_bytes());
        payload.extend_from_slice(self.descriptors.as_slice());
        for (&pid, stream) in &self.streams {
            payload.push(stream.stream_type);
            payload.extend_from_slice(&(0xE000 | (pid & 0x1FFF)).to_be_bytes());
            payload.extend_from_slice(&(0xF000 | stream.descriptors.size() as u16).to_be_bytes());
            payload.extend_from_slice(stream.descriptors.as_slice());
        }
        if payload.len() + MIN_LONG_SECTION_SIZE > MAX_PSI_SECTION_SIZE {
            return Err(TsError::SectionOverflow(payload.len()));
        }
        Section::new_long(TID_PMT, self.service_id, self.version, true, 0, 0, &payload)
    }
}
