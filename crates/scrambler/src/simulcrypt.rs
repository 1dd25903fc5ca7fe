//! DVB SimulCrypt ECMG <=> SCS wire protocol.
//!
//! Frame format:
//! ```text
//! +---------+--------------+----------------+------------------------+
//! | Version | Message type | Message length |       Parameters       |
//! |  u8     |   u16 BE     |     u16 BE     |  TLV (u16 type,        |
//! |         |              |                |       u16 length,      |
//! |         |              |                |       value bytes)     |
//! +---------+--------------+----------------+------------------------+
//! ```
//!
//! Only the messages and parameters exchanged by a scrambler are modeled:
//! channel and stream setup/status/test/close, CW provision and ECM
//! response, plus the error messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ScramblerError;
use crate::Result;

/// Protocol version byte for ECMG <=> SCS version 2
pub const PROTOCOL_VERSION_2: u8 = 2;
/// Protocol version byte for ECMG <=> SCS version 3
pub const PROTOCOL_VERSION_3: u8 = 3;

/// Size of the frame header: version + type + length
pub const HEADER_SIZE: usize = 5;

// Message types
pub const MSG_CHANNEL_SETUP: u16 = 0x0001;
pub const MSG_CHANNEL_TEST: u16 = 0x0002;
pub const MSG_CHANNEL_STATUS: u16 = 0x0003;
pub const MSG_CHANNEL_CLOSE: u16 = 0x0004;
pub const MSG_CHANNEL_ERROR: u16 = 0x0005;
pub const MSG_STREAM_SETUP: u16 = 0x0101;
pub const MSG_STREAM_TEST: u16 = 0x0102;
pub const MSG_STREAM_STATUS: u16 = 0x0103;
pub const MSG_STREAM_CLOSE_REQUEST: u16 = 0x0104;
pub const MSG_STREAM_CLOSE_RESPONSE: u16 = 0x0105;
pub const MSG_STREAM_ERROR: u16 = 0x0106;
pub const MSG_CW_PROVISION: u16 = 0x0201;
pub const MSG_ECM_RESPONSE: u16 = 0x0202;

// Parameter types
const PAR_SUPER_CAS_ID: u16 = 0x0001;
const PAR_SECTION_TSPKT_FLAG: u16 = 0x0002;
const PAR_DELAY_START: u16 = 0x0003;
const PAR_DELAY_STOP: u16 = 0x0004;
const PAR_MAX_STREAMS: u16 = 0x0008;
const PAR_MIN_CP_DURATION: u16 = 0x0009;
const PAR_LEAD_CW: u16 = 0x000A;
const PAR_CW_PER_MSG: u16 = 0x000B;
const PAR_MAX_COMP_TIME: u16 = 0x000C;
const PAR_ACCESS_CRITERIA: u16 = 0x000D;
const PAR_ECM_CHANNEL_ID: u16 = 0x000E;
const PAR_ECM_STREAM_ID: u16 = 0x000F;
const PAR_NOMINAL_CP_DURATION: u16 = 0x0010;
const PAR_ACCESS_CRITERIA_TRANSFER_MODE: u16 = 0x0011;
const PAR_CP_NUMBER: u16 = 0x0012;
const PAR_CP_DURATION: u16 = 0x0013;
const PAR_CP_CW_COMBINATION: u16 = 0x0014;
const PAR_ECM_DATAGRAM: u16 = 0x0015;
const PAR_ECM_ID: u16 = 0x0019;
const PAR_ERROR_STATUS: u16 = 0x7000;

/// Channel parameters returned by the ECMG at channel setup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStatus {
    pub channel_id: u16,
    /// true: ECMs are delivered as TS packets; false: as raw sections
    pub section_tspkt_flag: bool,
    /// Delay between crypto-period start and ECM broadcast start, in ms
    pub delay_start: i16,
    pub delay_stop: i16,
    pub max_streams: u16,
    pub min_cp_duration_100ms: u16,
    pub lead_cw: u8,
    pub cw_per_msg: u8,
    pub max_comp_time_ms: u16,
}

/// Stream parameters returned by the ECMG at stream setup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStatus {
    pub channel_id: u16,
    pub stream_id: u16,
    pub ecm_id: u16,
    pub access_criteria_transfer_mode: bool,
}

/// One ECMG <=> SCS message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ChannelSetup {
        channel_id: u16,
        super_cas_id: u32,
    },
    ChannelTest {
        channel_id: u16,
    },
    ChannelStatus(ChannelStatus),
    ChannelClose {
        channel_id: u16,
    },
    ChannelError {
        channel_id: u16,
        error_status: u16,
    },
    StreamSetup {
        channel_id: u16,
        stream_id: u16,
        ecm_id: u16,
        nominal_cp_duration_100ms: u16,
    },
    StreamTest {
        channel_id: u16,
        stream_id: u16,
    },
    StreamStatus(StreamStatus),
    StreamCloseRequest {
        channel_id: u16,
        stream_id: u16,
    },
    StreamCloseResponse {
        channel_id: u16,
        stream_id: u16,
    },
    StreamError {
        channel_id: u16,
        stream_id: u16,
        error_status: u16,
    },
    CwProvision {
        channel_id: u16,
        stream_id: u16,
        cp_number: u16,
        /// (crypto-period number, control word) pairs
        cw_combinations: Vec<(u16, [u8; 8])>,
        cp_duration_100ms: Option<u16>,
        access_criteria: Option<Bytes>,
    },
    EcmResponse {
        channel_id: u16,
        stream_id: u16,
        cp_number: u16,
        ecm_datagram: Bytes,
    },
}

impl Message {
    pub fn message_type(&self) -> u16 {
        match self {
            Message::ChannelSetup { .. } => MSG_CHANNEL_SETUP,
            Message::ChannelTest { .. } => MSG_CHANNEL_TEST,
            Message::ChannelStatus(_) => MSG_CHANNEL_STATUS,
            Message::ChannelClose { .. } => MSG_CHANNEL_CLOSE,
            Message::ChannelError { .. } => MSG_CHANNEL_ERROR,
            Message::StreamSetup { .. } => MSG_STREAM_SETUP,
            Message::StreamTest { .. } => MSG_STREAM_TEST,
            Message::StreamStatus(_) => MSG_STREAM_STATUS,
            Message::StreamCloseRequest { .. } => MSG_STREAM_CLOSE_REQUEST,
            Message::StreamCloseResponse { .. } => MSG_STREAM_CLOSE_RESPONSE,
            Message::StreamError { .. } => MSG_STREAM_ERROR,
            Message::CwProvision { .. } => MSG_CW_PROVISION,
            Message::EcmResponse { .. } => MSG_ECM_RESPONSE,
        }
    }
}

fn put_param(out: &mut BytesMut, ptype: u16, value: &[u8]) {
    out.put_u16(ptype);
    out.put_u16(value.len() as u16);
    out.put_slice(value);
}

fn put_param_u8(out: &mut BytesMut, ptype: u16, value: u8) {
    put_param(out, ptype, &[value]);
}

fn put_param_u16(out: &mut BytesMut, ptype: u16, value: u16) {
    put_param(out, ptype, &value.to_be_bytes());
}

/// Encode a message into a complete frame.
pub fn encode_message(msg: &Message, version: u8) -> Bytes {
    let mut body = BytesMut::with_capacity(64);
    match msg {
        Message::ChannelSetup {
            channel_id,
            super_cas_id,
        } => {
            put_param_u16(&mut body, PAR_ECM_CHANNEL_ID, *channel_id);
            put_param(&mut body, PAR_SUPER_CAS_ID, &super_cas_id.to_be_bytes());
        }
        Message::ChannelTest { channel_id } | Message::ChannelClose { channel_id } => {
            put_param_u16(&mut body, PAR_ECM_CHANNEL_ID, *channel_id);
        }
        Message::ChannelStatus(status) => {
            put_param_u16(&mut body, PAR_ECM_CHANNEL_ID, status.channel_id);
            put_param_u8(
                &mut body,
                PAR_SECTION_TSPKT_FLAG,
                status.section_tspkt_flag.into(),
            );
            put_param(&mut body, PAR_DELAY_START, &status.delay_start.to_be_bytes());
            put_param(&mut body, PAR_DELAY_STOP, &status.delay_stop.to_be_bytes());
            put_param_u16(&mut body, PAR_MAX_STREAMS, status.max_streams);
            put_param_u16(&mut body, PAR_MIN_CP_DURATION, status.min_cp_duration_100ms);
            put_param_u8(&mut body, PAR_LEAD_CW, status.lead_cw);
            put_param_u8(&mut body, PAR_CW_PER_MSG, status.cw_per_msg);
            put_param_u16(&mut body, PAR_MAX_COMP_TIME, status.max_comp_time_ms);
        }
        Message::ChannelError {
            channel_id,
            error_status,
        } => {
            put_param_u16(&mut body, PAR_ECM_CHANNEL_ID, *channel_id);
            put_param_u16(&mut body, PAR_ERROR_STATUS, *error_status);
        }
        Message::StreamSetup {
            channel_id,
            stream_id,
            ecm_id,
            nominal_cp_duration_100ms,
        } => {
            put_param_u16(&mut body, PAR_ECM_CHANNEL_ID, *channel_id);
            put_param_u16(&mut body, PAR_ECM_STREAM_ID, *stream_id);
            put_param_u16(&mut body, PAR_ECM_ID, *ecm_id);
            put_param_u16(&mut body, PAR_NOMINAL_CP_DURATION, *nominal_cp_duration_100ms);
        }
        Message::StreamTest {
            channel_id,
            stream_id,
        }
        | Message::StreamCloseRequest {
            channel_id,
            stream_id,
        }
        | Message::StreamCloseResponse {
            channel_id,
            stream_id,
        } => {
            put_param_u16(&mut body, PAR_ECM_CHANNEL_ID, *channel_id);
            put_param_u16(&mut body, PAR_ECM_STREAM_ID, *stream_id);
        }
        Message::StreamStatus(status) => {
            put_param_u16(&mut body, PAR_ECM_CHANNEL_ID, status.channel_id);
            put_param_u16(&mut body, PAR_ECM_STREAM_ID, status.stream_id);
            put_param_u16(&mut body, PAR_ECM_ID, status.ecm_id);
            put_param_u8(
                &mut body,
                PAR_ACCESS_CRITERIA_TRANSFER_MODE,
                status.access_criteria_transfer_mode.into(),
            );
        }
        Message::StreamError {
            channel_id,
            stream_id,
            error_status,
        } => {
            put_param_u16(&mut body, PAR_ECM_CHANNEL_ID, *channel_id);
            put_param_u16(&mut body, PAR_ECM_STREAM_ID, *stream_id);
            put_param_u16(&mut body, PAR_ERROR_STATUS, *error_status);
        }
        Message::CwProvision {
            channel_id,
            stream_id,
            cp_number,
            cw_combinations,
            cp_duration_100ms,
            access_criteria,
        } => {
            put_param_u16(&mut body, PAR_ECM_CHANNEL_ID, *channel_id);
            put_param_u16(&mut body, PAR_ECM_STREAM_ID, *stream_id);
            put_param_u16(&mut body, PAR_CP_NUMBER, *cp_number);
            for (number, cw) in cw_combinations {
                let mut combo = [0u8; 10];
                combo[..2].copy_from_slice(&number.to_be_bytes());
                combo[2..].copy_from_slice(cw);
                put_param(&mut body, PAR_CP_CW_COMBINATION, &combo);
            }
            if let Some(duration) = cp_duration_100ms {
                put_param_u16(&mut body, PAR_CP_DURATION, *duration);
            }
            if let Some(ac) = access_criteria {
                put_param(&mut body, PAR_ACCESS_CRITERIA, ac);
            }
        }
        Message::EcmResponse {
            channel_id,
            stream_id,
            cp_number,
            ecm_datagram,
        } => {
            put_param_u16(&mut body, PAR_ECM_CHANNEL_ID, *channel_id);
            put_param_u16(&mut body, PAR_ECM_STREAM_ID, *stream_id);
            put_param_u16(&mut body, PAR_CP_NUMBER, *cp_number);
            put_param(&mut body, PAR_ECM_DATAGRAM, ecm_datagram);
        }
    }

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + body.len());
    frame.put_u8(version);
    frame.put_u16(msg.message_type());
    frame.put_u16(body.len() as u16);
    frame.put_slice(&body);
    frame.freeze()
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub version: u8,
    pub message_type: u16,
    pub length: usize,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> FrameHeader {
        FrameHeader {
            version: bytes[0],
            message_type: u16::from_be_bytes([bytes[1], bytes[2]]),
            length: u16::from_be_bytes([bytes[3], bytes[4]]) as usize,
        }
    }
}

/// Accumulates the TLV parameters of one message body.
#[derive(Debug, Default)]
struct Params {
    channel_id: Option<u16>,
    stream_id: Option<u16>,
    ecm_id: Option<u16>,
    super_cas_id: Option<u32>,
    section_tspkt_flag: Option<u8>,
    delay_start: Option<i16>,
    delay_stop: Option<i16>,
    max_streams: Option<u16>,
    min_cp_duration: Option<u16>,
    lead_cw: Option<u8>,
    cw_per_msg: Option<u8>,
    max_comp_time: Option<u16>,
    ac_transfer_mode: Option<u8>,
    cp_number: Option<u16>,
    cp_duration: Option<u16>,
    nominal_cp_duration: Option<u16>,
    cw_combinations: Vec<(u16, [u8; 8])>,
    access_criteria: Option<Bytes>,
    ecm_datagram: Option<Bytes>,
    error_status: Option<u16>,
}

fn need_u8(value: &[u8]) -> Result<u8> {
    value
        .first()
        .copied()
        .ok_or_else(|| ScramblerError::Protocol("empty u8 parameter".into()))
}

fn need_u16(value: &[u8]) -> Result<u16> {
    let bytes: [u8; 2] = value
        .try_into()
        .map_err(|_| ScramblerError::Protocol(format!("bad u16 parameter size {}", value.len())))?;
    Ok(u16::from_be_bytes(bytes))
}

fn need_u32(value: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = value
        .try_into()
        .map_err(|_| ScramblerError::Protocol(format!("bad u32 parameter size {}", value.len())))?;
    Ok(u32::from_be_bytes(bytes))
}

fn parse_params(mut body: Bytes) -> Result<Params> {
    let mut params = Params::default();
    while body.remaining() >= 4 {
        let ptype = body.get_u16();
        let plen = body.get_u16() as usize;
        if body.remaining() < plen {
            return Err(ScramblerError::Protocol(format!(
                "truncated parameter {ptype:#06x}: {plen} bytes announced, {} left",
                body.remaining()
            )));
        }
        let value = body.split_to(plen);
        match ptype {
            PAR_ECM_CHANNEL_ID => params.channel_id = Some(need_u16(&value)?),
            PAR_ECM_STREAM_ID => params.stream_id = Some(need_u16(&value)?),
            PAR_ECM_ID => params.ecm_id = Some(need_u16(&value)?),
            PAR_SUPER_CAS_ID => params.super_cas_id = Some(need_u32(&value)?),
            PAR_SECTION_TSPKT_FLAG => params.section_tspkt_flag = Some(need_u8(&value)?),
            PAR_DELAY_START => params.delay_start = Some(need_u16(&value)? as i16),
            PAR_DELAY_STOP => params.delay_stop = Some(need_u16(&value)? as i16),
            PAR_MAX_STREAMS => params.max_streams = Some(need_u16(&value)?),
            PAR_MIN_CP_DURATION => params.min_cp_duration = Some(need_u16(&value)?),
            PAR_LEAD_CW => params.lead_cw = Some(need_u8(&value)?),
            PAR_CW_PER_MSG => params.cw_per_msg = Some(need_u8(&value)?),
            PAR_MAX_COMP_TIME => params.max_comp_time = Some(need_u16(&value)?),
            PAR_ACCESS_CRITERIA_TRANSFER_MODE => params.ac_transfer_mode = Some(need_u8(&value)?),
            PAR_CP_NUMBER => params.cp_number = Some(need_u16(&value)?),
            PAR_CP_DURATION => params.cp_duration = Some(need_u16(&value)?),
            PAR_NOMINAL_CP_DURATION => params.nominal_cp_duration = Some(need_u16(&value)?),
            PAR_CP_CW_COMBINATION => {
                if value.len() < 10 {
                    return Err(ScramblerError::Protocol(
                        "short CP/CW combination".into(),
                    ));
                }
                let number = u16::from_be_bytes([value[0], value[1]]);
                let mut cw = [0u8; 8];
                cw.copy_from_slice(&value[2..10]);
                params.cw_combinations.push((number, cw));
            }
            PAR_ACCESS_CRITERIA => params.access_criteria = Some(value),
            PAR_ECM_DATAGRAM => params.ecm_datagram = Some(value),
            PAR_ERROR_STATUS => params.error_status = Some(need_u16(&value)?),
            // Unknown parameters are skipped; later protocol versions add
            // parameters a version 2/3 peer must tolerate.
            _ => {}
        }
    }
    Ok(params)
}

/// Decode a message body given its frame header type.
pub fn decode_body(message_type: u16, body: Bytes) -> Result<Message> {
    let p = parse_params(body)?;
    let channel_id = p.channel_id.unwrap_or_default();
    let stream_id = p.stream_id.unwrap_or_default();
    let msg = match message_type {
        MSG_CHANNEL_SETUP => Message::ChannelSetup {
            channel_id,
            super_cas_id: p.super_cas_id.unwrap_or_default(),
        },
        MSG_CHANNEL_TEST => Message::ChannelTest { channel_id },
        MSG_CHANNEL_STATUS => Message::ChannelStatus(ChannelStatus {
            channel_id,
            section_tspkt_flag: p.section_tspkt_flag.unwrap_or(1) != 0,
            delay_start: p.delay_start.unwrap_or_default(),
            delay_stop: p.delay_stop.unwrap_or_default(),
            max_streams: p.max_streams.unwrap_or_default(),
            min_cp_duration_100ms: p.min_cp_duration.unwrap_or_default(),
            lead_cw: p.lead_cw.unwrap_or_default(),
            cw_per_msg: p.cw_per_msg.unwrap_or(2),
            max_comp_time_ms: p.max_comp_time.unwrap_or_default(),
        }),
        MSG_CHANNEL_CLOSE => Message::ChannelClose { channel_id },
        MSG_CHANNEL_ERROR => Message::ChannelError {
            channel_id,
            error_status: p.error_status.unwrap_or_default(),
        },
        MSG_STREAM_SETUP => Message::StreamSetup {
            channel_id,
            stream_id,
            ecm_id: p.ecm_id.unwrap_or_default(),
            nominal_cp_duration_100ms: p.nominal_cp_duration.unwrap_or_default(),
        },
        MSG_STREAM_TEST => Message::StreamTest {
            channel_id,
            stream_id,
        },
        MSG_STREAM_STATUS => Message::StreamStatus(StreamStatus {
            channel_id,
            stream_id,
            ecm_id: p.ecm_id.unwrap_or_default(),
            access_criteria_transfer_mode: p.ac_transfer_mode.unwrap_or_default() != 0,
        }),
        MSG_STREAM_CLOSE_REQUEST => Message::StreamCloseRequest {
            channel_id,
            stream_id,
        },
        MSG_STREAM_CLOSE_RESPONSE => Message::StreamCloseResponse {
            channel_id,
            stream_id,
        },
        MSG_STREAM_ERROR => Message::StreamError {
            channel_id,
            stream_id,
            error_status: p.error_status.unwrap_or_default(),
        },
        MSG_CW_PROVISION => Message::CwProvision {
            channel_id,
            stream_id,
            cp_number: p.cp_number.unwrap_or_default(),
            cw_combinations: p.cw_combinations,
            cp_duration_100ms: p.cp_duration,
            access_criteria: p.access_criteria,
        },
        MSG_ECM_RESPONSE => Message::EcmResponse {
            channel_id,
            stream_id,
            cp_number: p.cp_number.unwrap_or_default(),
            ecm_datagram: p.ecm_datagram.unwrap_or_default(),
        },
        other => return Err(ScramblerError::UnexpectedMessage(other)),
    };
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) -> Message {
        let frame = encode_message(&msg, PROTOCOL_VERSION_2);
        let header = FrameHeader::parse(frame[..HEADER_SIZE].try_into().unwrap());
        assert_eq!(header.version, PROTOCOL_VERSION_2);
        assert_eq!(header.length, frame.len() - HEADER_SIZE);
        decode_body(header.message_type, frame.slice(HEADER_SIZE..)).unwrap()
    }

    #[test]
    fn test_channel_setup_roundtrip() {
        let msg = Message::ChannelSetup {
            channel_id: 7,
            super_cas_id: 0x4AD1_0001,
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_channel_status_roundtrip() {
        let msg = Message::ChannelStatus(ChannelStatus {
            channel_id: 1,
            section_tspkt_flag: false,
            delay_start: -250,
            delay_stop: 100,
            max_streams: 8,
            min_cp_duration_100ms: 50,
            lead_cw: 1,
            cw_per_msg: 2,
            max_comp_time_ms: 5000,
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_cw_provision_roundtrip() {
        let msg = Message::CwProvision {
            channel_id: 1,
            stream_id: 2,
            cp_number: 42,
            cw_combinations: vec![(42, [1; 8]), (43, [2; 8])],
            cp_duration_100ms: Some(100),
            access_criteria: Some(Bytes::from_static(&[0xCA, 0xFE])),
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_ecm_response_roundtrip() {
        let msg = Message::EcmResponse {
            channel_id: 1,
            stream_id: 2,
            cp_number: 9,
            ecm_datagram: Bytes::from(vec![0x80; 64]),
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_stream_error_roundtrip() {
        let msg = Message::StreamError {
            channel_id: 3,
            stream_id: 4,
            error_status: 0x0010,
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_unknown_parameter_skipped() {
        let mut frame = BytesMut::new();
        // channel test with an unknown trailing parameter
        frame.put_u16(0x0E0F); // unknown type
        frame.put_u16(2);
        frame.put_u16(0xBEEF);
        let mut body = BytesMut::new();
        body.put_u16(super::PAR_ECM_CHANNEL_ID);
        body.put_u16(2);
        body.put_u16(5);
        body.put_slice(&frame);
        let msg = decode_body(MSG_CHANNEL_TEST, body.freeze()).unwrap();
        assert_eq!(msg, Message::ChannelTest { channel_id: 5 });
    }

    #[test]
    fn test_truncated_parameter_rejected() {
        let mut body = BytesMut::new();
        body.put_u16(super::PAR_ECM_DATAGRAM);
        body.put_u16(100);
        body.put_slice(&[0u8; 10]);
        assert!(decode_body(MSG_ECM_RESPONSE, body.freeze()).is_err());
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        assert!(matches!(
            decode_body(0x0F0F, Bytes::new()),
            Err(ScramblerError::UnexpectedMessage(0x0F0F))
        ));
    }
}
