//! Section-to-packet conversion.
//!
//! Two flavors are provided: [`CyclingPacketizer`] repeats its section list
//! forever (used to re-broadcast a rebuilt table at the cadence of the
//! original), [`OneShotPacketizer`] emits its sections exactly once (used to
//! pre-packetize ECMs).
//!
//! Both apply the always-stuff policy: every section starts in a fresh
//! packet with the unit start indicator set and a zero pointer field, and
//! the unused tail of a packet is 0xFF stuffing. Receivers resynchronize on
//! every section this way, at the price of a little padding.

use crate::packet::{TsPacket, TsPacketBuilder};
use crate::pid::PID_NULL;
use crate::section::Section;
use crate::table::BinaryTable;

/// Endless packetizer cycling over a section list.
#[derive(Debug, Default)]
pub struct CyclingPacketizer {
    pid: u16,
    cc: u8,
    sections: Vec<Section>,
    current: usize,
    offset: usize,
}

impl CyclingPacketizer {
    pub fn new() -> Self {
        CyclingPacketizer {
            pid: PID_NULL,
            ..Default::default()
        }
    }

    pub fn set_pid(&mut self, pid: u16) {
        self.pid = pid;
    }

    #[inline]
    pub fn pid(&self) -> u16 {
        self.pid
    }

    /// Drop all sections; the PID and continuity counter are kept.
    pub fn reset(&mut self) {
        self.sections.clear();
        self.restart_cycle();
    }

    pub fn add_section(&mut self, section: Section) {
        self.sections.push(section);
        self.restart_cycle();
    }

    /// Add all sections of a table.
    pub fn add_table(&mut self, table: &BinaryTable) {
        self.sections.extend(table.sections().cloned());
        self.restart_cycle();
    }

    /// Remove the sections of one extended table id (typically before
    /// re-adding the table's new version).
    pub fn remove_sections(&mut self, table_id: u8, extension: u16) {
        self.sections
            .retain(|s| s.table_id() != table_id || s.table_id_extension() != extension);
        self.restart_cycle();
    }

    // Mutating the section list restarts the cycle at a packet boundary, so
    // the cursor can never point into a removed section.
    fn restart_cycle(&mut self) {
        self.current = 0;
        self.offset = 0;
    }

    /// Produce the next packet of the cycle; null packets while the section
    /// list is empty.
    pub fn next_packet(&mut self) -> TsPacket {
        if self.sections.is_empty() {
            return TsPacket::null();
        }
        let cc = self.cc;
        self.cc = (self.cc + 1) % 16;

        let bytes = self.sections[self.current].as_bytes();
        let mut builder = TsPacketBuilder::payload_only(self.pid, cc);
        if self.offset == 0 {
            builder = builder.pusi(true).push(&[0]);
        }
        let take = builder.remaining().min(bytes.len() - self.offset);
        builder = builder.push(&bytes[self.offset..self.offset + take]);
        self.offset += take;
        if self.offset >= bytes.len() {
            self.offset = 0;
            self.current = (self.current + 1) % self.sections.len();
        }
        builder.build()
    }
}

/// Packetizer that emits its section list exactly once.
#[derive(Debug, Default)]
pub struct OneShotPacketizer {
    pid: u16,
    sections: Vec<Section>,
}

impl OneShotPacketizer {
    pub fn new(pid: u16) -> Self {
        OneShotPacketizer {
            pid,
            sections: Vec::new(),
        }
    }

    pub fn add_section(&mut self, section: Section) {
        self.sections.push(section);
    }

    /// Consume the queued sections into packets.
    pub fn packets(&mut self) -> Vec<TsPacket> {
        let mut out = Vec::new();
        let mut cc = 0u8;
        for section in self.sections.drain(..) {
            let bytes = section.as_bytes();
            let mut offset = 0usize;
            while offset < bytes.len() {
                let mut builder = TsPacketBuilder::payload_only(self.pid, cc);
                cc = (cc + 1) % 16;
                if offset == 0 {
                    builder = builder.pusi(true).push(&[0]);
                }
                let take = builder.remaining().min(bytes.len() - offset);
                builder = builder.push(&bytes[offset..offset + take]);
                offset += take;
                out.push(builder.build());
            }
        }
        out
    }
}
