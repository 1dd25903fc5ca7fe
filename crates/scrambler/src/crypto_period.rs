//! Crypto-period slots.
//!
//! The scrambler rotates between two [`CryptoPeriod`] slots. Each slot owns
//! the crypto-period number, the current and next control words, and a
//! shared [`EcmSlot`] that the ECMG callback thread fills with the
//! pre-packetized ECM. The packet thread observes readiness through one
//! acquire load; the callback publishes with one release store, performed
//! strictly after every other slot write.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::RngCore;
use rand::rngs::StdRng;
use tracing::{debug, error};

use crate::Result;
use crate::csa::{CW_SIZE, CsaKey, EntropyMode};
use crate::ecmg::{EcmGenerator, EcmRequest};
use crate::error::ScramblerError;
use ts::packet::{PKT_SIZE, SC_EVEN_KEY, SC_ODD_KEY};
use ts::section::Section;
use ts::{OneShotPacketizer, TsPacket};

/// The ECM payload of one crypto-period, shared between the packet thread
/// and the ECMG callback thread.
pub struct EcmSlot {
    ready: AtomicBool,
    data: Mutex<EcmData>,
}

#[derive(Default)]
struct EcmData {
    packets: Vec<TsPacket>,
    next_index: usize,
}

impl EcmSlot {
    pub fn new() -> Self {
        EcmSlot {
            ready: AtomicBool::new(false),
            data: Mutex::new(EcmData::default()),
        }
    }

    /// Whether the ECM has been published. Acquire pairs with the release
    /// in [`EcmSlot::publish`].
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Publish the packetized ECM. The release store on `ready` is the last
    /// write; everything else must already be visible.
    pub fn publish(&self, packets: Vec<TsPacket>) {
        {
            let mut data = self.data.lock();
            data.packets = packets;
            data.next_index = 0;
        }
        self.ready.store(true, Ordering::Release);
    }

    /// Next packet of the ECM cycle; `None` while unpublished or empty.
    fn next_packet(&self) -> Option<TsPacket> {
        if !self.is_ready() {
            return None;
        }
        let mut data = self.data.lock();
        if data.packets.is_empty() {
            return None;
        }
        let index = data.next_index;
        data.next_index = (index + 1) % data.packets.len();
        Some(data.packets[index])
    }
}

impl Default for EcmSlot {
    fn default() -> Self {
        EcmSlot::new()
    }
}

/// Everything a crypto-period needs from its owner to (re)generate its ECM.
/// Passed explicitly at each call; slots hold no reference back to the
/// plugin.
pub struct EcmContext<'a> {
    pub generator: &'a mut dyn EcmGenerator,
    pub synchronous: bool,
    pub access_criteria: &'a [u8],
    pub cp_duration_100ms: u16,
    /// true: the ECMG returns TS packets; false: a raw section
    pub section_tspkt_flag: bool,
    /// ECM PID at submission time; restamped again at insertion
    pub ecm_pid: u16,
    pub abort: &'a Arc<AtomicBool>,
    pub cw_gen: &'a mut StdRng,
}

/// One crypto-period: its number, control words and (pending) ECM.
pub struct CryptoPeriod {
    cp_number: u16,
    cw_current: [u8; CW_SIZE],
    cw_next: [u8; CW_SIZE],
    slot: Arc<EcmSlot>,
}

impl CryptoPeriod {
    pub fn new() -> Self {
        CryptoPeriod {
            cp_number: 0,
            cw_current: [0; CW_SIZE],
            cw_next: [0; CW_SIZE],
            slot: Arc::new(EcmSlot::new()),
        }
    }

    #[inline]
    pub fn cp_number(&self) -> u16 {
        self.cp_number
    }

    #[inline]
    pub fn cw_next(&self) -> [u8; CW_SIZE] {
        self.cw_next
    }

    /// Start the very first crypto-period: draw both control words fresh
    /// and request its ECM.
    pub fn init_cycle(&mut self, cp_number: u16, ctx: &mut EcmContext<'_>) -> Result<()> {
        self.cp_number = cp_number;
        ctx.cw_gen.fill_bytes(&mut self.cw_current);
        ctx.cw_gen.fill_bytes(&mut self.cw_next);
        self.generate_ecm(ctx)
    }

    /// Arm this slot as the successor of another crypto-period: the
    /// previous "next" control word becomes current, a fresh one is drawn,
    /// and the ECM is requested.
    pub fn init_next(
        &mut self,
        prev_cp_number: u16,
        prev_cw_next: [u8; CW_SIZE],
        ctx: &mut EcmContext<'_>,
    ) -> Result<()> {
        self.cp_number = prev_cp_number.wrapping_add(1);
        self.cw_current = prev_cw_next;
        ctx.cw_gen.fill_bytes(&mut self.cw_next);
        self.generate_ecm(ctx)
    }

    /// Whether this period's ECM is ready for broadcast.
    pub fn ecm_ready(&self) -> bool {
        self.slot.is_ready()
    }

    /// Next ECM packet, restamped onto the ECM PID with a fresh continuity
    /// counter. A null packet when the ECM is not ready or empty.
    pub fn next_ecm_packet(&self, ecm_pid: u16, ecm_cc: &mut u8) -> TsPacket {
        match self.slot.next_packet() {
            Some(mut pkt) => {
                pkt.set_pid(ecm_pid);
                pkt.set_continuity_counter(*ecm_cc);
                *ecm_cc = (*ecm_cc + 1) % 16;
                pkt
            }
            None => TsPacket::null(),
        }
    }

    /// Scrambling control value for packets of this period: the parity of
    /// the crypto-period number selects the odd or even key.
    pub fn scrambling_control(&self) -> u8 {
        if self.cp_number & 1 == 1 {
            SC_ODD_KEY
        } else {
            SC_EVEN_KEY
        }
    }

    /// The scrambling key of this period's current control word.
    pub fn csa_key(&self, mode: EntropyMode) -> CsaKey {
        CsaKey::new(&self.cw_current, mode)
    }

    /// Request ECM generation for this period. A fresh slot replaces the
    /// previous one so a late callback from an earlier cycle cannot publish
    /// into the new period.
    fn generate_ecm(&mut self, ctx: &mut EcmContext<'_>) -> Result<()> {
        self.slot = Arc::new(EcmSlot::new());
        let request = EcmRequest {
            cp_number: self.cp_number,
            cw_current: self.cw_current,
            cw_next: self.cw_next,
            access_criteria: ctx.access_criteria.to_vec(),
            cp_duration_100ms: ctx.cp_duration_100ms,
        };
        if ctx.synchronous {
            let response = ctx.generator.generate(request)?;
            let packets =
                packetize_ecm(response.ecm_datagram, ctx.section_tspkt_flag, ctx.ecm_pid)?;
            debug!(
                cp_number = self.cp_number,
                packets = packets.len(),
                "ECM generated"
            );
            self.slot.publish(packets);
            Ok(())
        } else {
            let slot = self.slot.clone();
            let abort = ctx.abort.clone();
            let section_tspkt_flag = ctx.section_tspkt_flag;
            let ecm_pid = ctx.ecm_pid;
            let cp_number = self.cp_number;
            ctx.generator.submit(
                request,
                Box::new(move |result| {
                    let packetized = result.and_then(|response| {
                        packetize_ecm(response.ecm_datagram, section_tspkt_flag, ecm_pid)
                    });
                    match packetized {
                        Ok(packets) => {
                            debug!(cp_number, packets = packets.len(), "ECM received");
                            slot.publish(packets);
                        }
                        Err(e) => {
                            error!(cp_number, "ECM generation failed: {e}");
                            abort.store(true, Ordering::Release);
                        }
                    }
                }),
            )
        }
    }
}

impl Default for CryptoPeriod {
    fn default() -> Self {
        CryptoPeriod::new()
    }
}

/// Turn an ECM datagram into TS packets.
///
/// With `section_tspkt_flag` the ECMG already packetized: the size must be
/// a whole number of packets (zero packets are accepted: the slot simply
/// has nothing to broadcast). Otherwise the datagram is a raw section to
/// packetize here.
fn packetize_ecm(datagram: Bytes, section_tspkt_flag: bool, ecm_pid: u16) -> Result<Vec<TsPacket>> {
    if section_tspkt_flag {
        if datagram.len() % PKT_SIZE != 0 {
            return Err(ScramblerError::InvalidEcmSize(datagram.len()));
        }
        datagram
            .chunks_exact(PKT_SIZE)
            .map(|chunk| TsPacket::from_bytes(chunk).map_err(ScramblerError::from))
            .collect()
    } else {
        let section = Section::parse(datagram, ecm_pid)
            .map_err(|e| ScramblerError::Protocol(format!("invalid ECM section: {e}")))?;
        let mut packetizer = OneShotPacketizer::new(ecm_pid);
        packetizer.add_section(section);
        Ok(packetizer.packets())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_not_ready_initially() {
        let slot = EcmSlot::new();
        assert!(!slot.is_ready());
        assert!(slot.next_packet().is_none());
    }

    #[test]
    fn test_slot_publish_and_cycle() {
        let slot = EcmSlot::new();
        let mut a = TsPacket::null();
        a.set_pid(0x0700);
        let mut b = TsPacket::null();
        b.set_pid(0x0701);
        slot.publish(vec![a, b]);

        assert!(slot.is_ready());
        assert_eq!(slot.next_packet().unwrap().pid(), 0x0700);
        assert_eq!(slot.next_packet().unwrap().pid(), 0x0701);
        // Cycles back to the first packet.
        assert_eq!(slot.next_packet().unwrap().pid(), 0x0700);
    }

    #[test]
    fn test_empty_publication_yields_null_packets() {
        let cp = CryptoPeriod::new();
        cp.slot.publish(Vec::new());
        let mut cc = 0u8;
        let pkt = cp.next_ecm_packet(0x0700, &mut cc);
        assert!(pkt.is_null());
        // Continuity is not consumed for null filler.
        assert_eq!(cc, 0);
    }

    #[test]
    fn test_ecm_packet_restamping() {
        let cp = CryptoPeriod::new();
        cp.slot.publish(vec![TsPacket::null(), TsPacket::null()]);
        let mut cc = 14u8;
        for expected in [14u8, 15, 0, 1] {
            let pkt = cp.next_ecm_packet(0x0765, &mut cc);
            assert_eq!(pkt.pid(), 0x0765);
            assert_eq!(pkt.continuity_counter(), expected);
        }
    }

    #[test]
    fn test_scrambling_control_parity() {
        let mut cp = CryptoPeriod::new();
        assert_eq!(cp.scrambling_control(), SC_EVEN_KEY);
        cp.cp_number = 1;
        assert_eq!(cp.scrambling_control(), SC_ODD_KEY);
        cp.cp_number = 2;
        assert_eq!(cp.scrambling_control(), SC_EVEN_KEY);
    }

    #[test]
    fn test_packetize_section_mode() {
        let section = Section::new_long(0x80, 0, 0, true, 0, 0, &[0xEC; 40]).unwrap();
        let packets =
            packetize_ecm(Bytes::copy_from_slice(section.as_bytes()), false, 0x0700).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].pid(), 0x0700);
        assert!(packets[0].payload_unit_start_indicator());
    }

    #[test]
    fn test_packetize_packet_mode_size_rule() {
        assert!(packetize_ecm(Bytes::from(vec![0u8; 188]), true, 0x0700).is_ok());
        assert!(packetize_ecm(Bytes::from(vec![0u8; 189]), true, 0x0700).is_err());
        // Zero bytes: accepted as an empty slot.
        let packets = packetize_ecm(Bytes::new(), true, 0x0700).unwrap();
        assert!(packets.is_empty());
    }

    #[test]
    fn test_packetize_invalid_section_rejected() {
        assert!(packetize_ecm(Bytes::from_static(&[0x80, 0xB0]), false, 0x0700).is_err());
    }
}
