//! Section demultiplexer: rebuilds PSI/SI sections and tables from TS
//! packets, per PID.
//!
//! The demux is fed one packet at a time and synchronously invokes the
//! caller's handler for every complete valid section and for every complete
//! table. Parse anomalies are never fatal: they are counted in
//! [`DemuxStatus`] and the affected PID loses synchronization until the next
//! payload unit start.
//!
//! Handlers may re-enter the demux: they receive a [`DemuxControl`] on which
//! they can request filter changes or resets. Requests are queued and
//! applied when the handler returns; a request that invalidates the PID
//! being processed abandons the rest of the current packet.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::trace;

use crate::packet::{CC_MAX, PKT_SIZE, TsPacket};
use crate::pid::PidSet;
use crate::section::{
    Etid, MAX_PRIVATE_SECTION_SIZE, MIN_LONG_SECTION_SIZE, MIN_SHORT_SECTION_SIZE,
    SHORT_SECTION_HEADER_SIZE, Section,
};
use crate::table::BinaryTable;

/// Error counters of a [`SectionDemux`]. Single-writer, read as a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxStatus {
    /// TS packets with an invalid sync byte
    pub invalid_ts: u64,
    /// TS packet continuity errors
    pub discontinuities: u64,
    /// Scrambled TS packets on a section-bearing PID
    pub scrambled: u64,
    /// Sections with an invalid length field
    pub inv_sect_length: u64,
    /// Sections with an inconsistent section number
    pub inv_sect_index: u64,
    /// Sections with a wrong CRC-32
    pub wrong_crc: u64,
}

impl DemuxStatus {
    pub fn has_errors(&self) -> bool {
        self.invalid_ts != 0
            || self.discontinuities != 0
            || self.scrambled != 0
            || self.inv_sect_length != 0
            || self.inv_sect_index != 0
            || self.wrong_crc != 0
    }

    pub fn reset(&mut self) {
        *self = DemuxStatus::default();
    }
}

impl std::fmt::Display for DemuxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Invalid TS packets: {}", self.invalid_ts)?;
        writeln!(f, "TS packet discontinuities: {}", self.discontinuities)?;
        writeln!(f, "Scrambled TS packets: {}", self.scrambled)?;
        writeln!(f, "Invalid section lengths: {}", self.inv_sect_length)?;
        writeln!(f, "Invalid section index: {}", self.inv_sect_index)?;
        write!(f, "Corrupted sections (bad CRC): {}", self.wrong_crc)
    }
}

/// Receiver of demultiplexed sections and tables.
///
/// Both methods default to no-ops so a handler can subscribe to only the
/// granularity it cares about. Calls happen synchronously from within
/// [`SectionDemux::feed_packet`].
pub trait DemuxHandler {
    /// Invoked for every valid complete section, in stream order.
    fn handle_section(&mut self, _demux: &mut DemuxControl, _section: &Section) {}

    /// Invoked whenever the stored sections of an extended table id complete
    /// a full table version.
    fn handle_table(&mut self, _demux: &mut DemuxControl, _table: &BinaryTable) {}
}

/// Handle given to handlers for re-entrant demux mutations.
///
/// Requests queue up while the handler runs and are applied on return, so a
/// handler can drop the very PID it is being called for without invalidating
/// the state under the demux's feet.
#[derive(Debug, Default)]
pub struct DemuxControl {
    requests: Vec<FilterRequest>,
}

#[derive(Debug)]
enum FilterRequest {
    Add(u16),
    Remove(u16),
    Reset,
    ResetPid(u16),
}

impl DemuxControl {
    /// Start demultiplexing a PID.
    pub fn add_pid(&mut self, pid: u16) {
        self.requests.push(FilterRequest::Add(pid));
    }

    /// Stop demultiplexing a PID. When it is the PID currently being
    /// processed, the rest of the packet is abandoned.
    pub fn remove_pid(&mut self, pid: u16) {
        self.requests.push(FilterRequest::Remove(pid));
    }

    /// Drop the whole filter and all reassembly state.
    pub fn reset(&mut self) {
        self.requests.push(FilterRequest::Reset);
    }

    /// Drop one PID from the filter together with its reassembly state.
    pub fn reset_pid(&mut self, pid: u16) {
        self.requests.push(FilterRequest::ResetPid(pid));
    }
}

/// Reassembly state of one PID.
#[derive(Debug, Default)]
struct PidContext {
    /// Whether a section boundary has been located on this PID
    sync: bool,
    /// Last observed continuity counter
    continuity: u8,
    /// Accumulated section bytes awaiting a complete section
    ts_buffer: Vec<u8>,
    /// Index of the packet carrying the current section's first byte
    pusi_pkt_index: u64,
    /// Per-table reassembly slots
    tids: HashMap<Etid, EtidContext>,
}

impl PidContext {
    /// Forget the current partial section; wait for the next unit start.
    fn sync_lost(&mut self) {
        self.sync = false;
        self.ts_buffer.clear();
    }
}

/// Reassembly slots of one extended table id on one PID.
#[derive(Debug, Default)]
struct EtidContext {
    version: u8,
    sect_expected: usize,
    sect_received: usize,
    sects: Vec<Option<Section>>,
}

/// The section demultiplexer.
pub struct SectionDemux {
    pid_filter: PidSet,
    pids: HashMap<u16, PidContext>,
    status: DemuxStatus,
    packet_count: u64,
}

impl SectionDemux {
    pub fn new() -> Self {
        SectionDemux {
            pid_filter: PidSet::new(),
            pids: HashMap::new(),
            status: DemuxStatus::default(),
            packet_count: 0,
        }
    }

    /// Start demultiplexing a PID.
    pub fn add_pid(&mut self, pid: u16) {
        self.pid_filter.set(pid);
    }

    /// Stop demultiplexing a PID, keeping its reassembly state.
    pub fn remove_pid(&mut self, pid: u16) {
        self.pid_filter.clear(pid);
    }

    /// Drop the whole filter and all reassembly state.
    pub fn reset(&mut self) {
        self.pid_filter.clear_all();
        self.pids.clear();
    }

    /// Drop one PID from the filter together with its reassembly state.
    /// A no-op for PIDs never seen.
    pub fn reset_pid(&mut self, pid: u16) {
        self.pid_filter.clear(pid);
        self.pids.remove(&pid);
    }

    /// Snapshot of the error counters.
    pub fn status(&self) -> DemuxStatus {
        self.status
    }

    /// Number of packets fed so far (filtered or not).
    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    /// Offer one TS packet. Packets outside the PID filter only advance the
    /// packet counter.
    pub fn feed_packet(&mut self, pkt: &TsPacket, handler: &mut dyn DemuxHandler) {
        if self.pid_filter.test(pkt.pid()) {
            self.process_packet(pkt, handler);
        }
        self.packet_count += 1;
    }

    fn process_packet(&mut self, pkt: &TsPacket, handler: &mut dyn DemuxHandler) {
        if !pkt.has_valid_sync() {
            self.status.invalid_ts += 1;
            return;
        }

        // The context is taken out of the map for the duration of the
        // packet; handler-requested resets must not resurrect it, so it is
        // only put back when processing was not abandoned.
        let pid = pkt.pid();
        let mut pc = self.pids.remove(&pid).unwrap_or_default();
        if self.process_pid_packet(&mut pc, pkt, pid, handler) {
            self.pids.insert(pid, pc);
        }
    }

    /// Returns false when the PID context was invalidated by a handler.
    fn process_pid_packet(
        &mut self,
        pc: &mut PidContext,
        pkt: &TsPacket,
        pid: u16,
        handler: &mut dyn DemuxHandler,
    ) -> bool {
        // A scrambled packet cannot be decoded: count it and lose sync
        // (PIDs carrying sections are normally not scrambled).
        if pkt.is_scrambled() {
            self.status.scrambled += 1;
            pc.sync_lost();
            return true;
        }

        // Continuity check, only meaningful while synchronized.
        if pc.sync {
            if pkt.continuity_counter() == pc.continuity {
                // Duplicate packet
                return true;
            }
            if pkt.continuity_counter() != (pc.continuity + 1) % CC_MAX {
                self.status.discontinuities += 1;
                trace!(pid, "continuity break, losing section sync");
                pc.sync_lost();
            }
        }
        pc.continuity = pkt.continuity_counter();

        let header_size = pkt.header_size();
        if !pkt.has_payload() || header_size >= PKT_SIZE {
            return true;
        }

        let raw = pkt.as_bytes();
        let mut pointer_field = 0usize;
        let mut payload_start = header_size;
        let mut payload_size = PKT_SIZE - header_size;
        let mut pusi_pkt_index = pc.pusi_pkt_index;

        if pkt.payload_unit_start_indicator() {
            // Track the last packet containing a unit start on this PID.
            pc.pusi_pkt_index = self.packet_count;

            // Filter out PES packets. A PES packet starts with the start
            // code prefix 00 00 01, a sequence impossible in a section
            // payload (00 = pointer field, 00 = PAT table id, 01 = not a
            // possible PAT length there).
            if header_size + 3 <= PKT_SIZE && raw[header_size..header_size + 3] == [0, 0, 1] {
                trace!(pid, "PES start code on section PID, losing sync");
                pc.sync_lost();
                return true;
            }

            pointer_field = raw[header_size] as usize;
            payload_start = header_size + 1;
            payload_size = PKT_SIZE - header_size - 1;

            // An inconsistent pointer field loses sync. A pointer equal to
            // the remaining payload would place the section start in a later
            // packet, which a unit start cannot mean.
            if pointer_field >= payload_size {
                pc.sync_lost();
                return true;
            }
            if pointer_field == 0 {
                pusi_pkt_index = self.packet_count;
            }
        }

        // Without synchronization, skip up to the start of the new section.
        if !pc.sync {
            if !pkt.payload_unit_start_indicator() {
                return true;
            }
            payload_start += pointer_field;
            payload_size -= pointer_field;
            pointer_field = 0;
            pc.sync = true;
        }

        pc.ts_buffer
            .extend_from_slice(&raw[payload_start..payload_start + payload_size]);

        // Where the section announced by this packet's unit start begins in
        // the reassembly buffer. Used to detect a truncated predecessor.
        let pusi_section = pkt
            .payload_unit_start_indicator()
            .then(|| pc.ts_buffer.len() - payload_size + pointer_field);

        // Extract all complete sections from the buffer.
        let mut start = 0usize;
        let mut size = pc.ts_buffer.len();

        while size >= SHORT_SECTION_HEADER_SIZE {
            let mut section_ok = true;
            let raw_len = u16::from_be_bytes([pc.ts_buffer[start + 1], pc.ts_buffer[start + 2]]);
            let long_header = raw_len & 0x8000 != 0;
            let mut section_length = (raw_len & 0x0FFF) as usize + SHORT_SECTION_HEADER_SIZE;

            if section_length > MAX_PRIVATE_SECTION_SIZE
                || section_length < MIN_SHORT_SECTION_SIZE
                || (long_header && section_length < MIN_LONG_SECTION_SIZE)
            {
                self.status.inv_sect_length += 1;
                pc.sync_lost();
                return true;
            }

            // End of section not yet received, wait for more packets.
            if size < section_length {
                break;
            }

            // The unit start of this packet landing inside the current
            // section means the previous section was truncated upstream:
            // drop it and resynchronize on the actual section start.
            if let Some(ps) = pusi_section
                && start < ps
                && start + section_length > ps
            {
                section_ok = false;
                section_length = ps - start;
            }

            let mut etid = Etid::short(pc.ts_buffer[start]);
            let mut version = 0u8;
            let mut is_next = false;
            let mut section_number = 0u8;
            let mut last_section_number = 0u8;

            if section_ok && long_header {
                etid = Etid::long(
                    pc.ts_buffer[start],
                    u16::from_be_bytes([pc.ts_buffer[start + 3], pc.ts_buffer[start + 4]]),
                );
                version = (pc.ts_buffer[start + 5] >> 1) & 0x1F;
                is_next = pc.ts_buffer[start + 5] & 0x01 == 0;
                section_number = pc.ts_buffer[start + 6];
                last_section_number = pc.ts_buffer[start + 7];
                if section_number > last_section_number {
                    self.status.inv_sect_index += 1;
                    section_ok = false;
                }
            }

            // Sections of the next table version are not assembled.
            if is_next {
                section_ok = false;
            }

            if section_ok {
                let tc = pc.tids.entry(etid).or_default();

                // A short section, a new table id or a new version resets
                // the slots. Short sections carry no version, so each one
                // counts as a fresh single-section table.
                if !long_header || tc.sect_expected == 0 || tc.version != version {
                    tc.version = version;
                    tc.sect_expected = last_section_number as usize + 1;
                    tc.sect_received = 0;
                    tc.sects.clear();
                    tc.sects.resize(tc.sect_expected, None);
                }

                // The announced section count must not change mid-version.
                if last_section_number as usize + 1 != tc.sect_expected {
                    self.status.inv_sect_index += 1;
                    section_ok = false;
                }
            }

            if section_ok {
                let bytes = Bytes::copy_from_slice(&pc.ts_buffer[start..start + section_length]);
                match Section::parse(bytes, pid) {
                    Ok(mut section) => {
                        section.set_source_pid(pid);
                        section.set_pkt_indexes(pusi_pkt_index, self.packet_count);
                        if !section.has_valid_crc() {
                            self.status.wrong_crc += 1;
                        } else {
                            let mut ctrl = DemuxControl::default();
                            handler.handle_section(&mut ctrl, &section);

                            // Store new sections and assemble the table once
                            // every slot is filled.
                            let tc = pc.tids.entry(etid).or_default();
                            let slot = section_number as usize;
                            if tc.sects[slot].is_none() {
                                tc.sects[slot] = Some(section);
                                tc.sect_received += 1;
                                if tc.sect_received == tc.sect_expected
                                    && let Ok(table) = BinaryTable::from_sections(
                                        tc.sects.iter().flatten().cloned().collect(),
                                    )
                                {
                                    handler.handle_table(&mut ctrl, &table);
                                }
                            }

                            if self.apply_requests(ctrl, pid) {
                                return false;
                            }
                        }
                    }
                    Err(_) => {
                        // Framing was already validated; only a pathological
                        // length mismatch lands here.
                        self.status.inv_sect_length += 1;
                    }
                }
            }

            start += section_length;
            size -= section_length;

            // The next section necessarily starts in the current packet.
            pusi_pkt_index = self.packet_count;

            // A 0xFF table id marks stuffing: the rest of the buffer is
            // padding.
            if size > 0 && pc.ts_buffer[start] == 0xFF {
                size = 0;
            }
        }

        // Keep only the incomplete remainder, moved to the buffer start.
        if size == 0 {
            pc.ts_buffer.clear();
        } else if start > 0 {
            pc.ts_buffer.drain(..start);
        }
        true
    }

    /// Apply handler-queued requests. Returns true when the current PID's
    /// context was invalidated and the caller must stop touching it.
    fn apply_requests(&mut self, ctrl: DemuxControl, current_pid: u16) -> bool {
        let mut abandon = false;
        for request in ctrl.requests {
            match request {
                FilterRequest::Add(pid) => self.pid_filter.set(pid),
                FilterRequest::Remove(pid) => {
                    self.pid_filter.clear(pid);
                    if pid == current_pid {
                        abandon = true;
                    }
                }
                FilterRequest::Reset => {
                    self.pid_filter.clear_all();
                    self.pids.clear();
                    abandon = true;
                }
                FilterRequest::ResetPid(pid) => {
                    self.pid_filter.clear(pid);
                    self.pids.remove(&pid);
                    if pid == current_pid {
                        abandon = true;
                    }
                }
            }
        }
        abandon
    }
}

impl Default for SectionDemux {
    fn default() -> Self {
        SectionDemux::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TsPacketBuilder;

    /// Collects everything the demux hands out.
    #[derive(Default)]
    struct Collector {
        sections: Vec<Section>,
        tables: Vec<BinaryTable>,
        reset_pid_on_section: Option<u16>,
    }

    impl DemuxHandler for Collector {
        fn handle_section(&mut self, ctrl: &mut DemuxControl, section: &Section) {
            if let Some(pid) = self.reset_pid_on_section.take() {
                ctrl.reset_pid(pid);
            }
            self.sections.push(section.clone());
        }

        fn handle_table(&mut self, _ctrl: &mut DemuxControl, table: &BinaryTable) {
            self.tables.push(table.clone());
        }
    }

    /// One payload-only packet carrying `data` after an optional pointer
    /// field, padded with 0xFF stuffing.
    fn psi_packet(pid: u16, cc: u8, pusi: bool, pointer: u8, data: &[u8]) -> TsPacket {
        let mut b = TsPacketBuilder::payload_only(pid, cc).pusi(pusi);
        if pusi {
            b = b.push(&[pointer]);
        }
        b.push(data).build()
    }

    fn demux_for(pid: u16) -> SectionDemux {
        let mut demux = SectionDemux::new();
        demux.add_pid(pid);
        demux
    }

    #[test]
    fn test_single_short_section() {
        let mut demux = demux_for(0x100);
        let mut out = Collector::default();
        let sect = Section::new_short(0x40, b"payload").unwrap();

        demux.feed_packet(&psi_packet(0x100, 0, true, 0, sect.as_bytes()), &mut out);

        assert_eq!(out.sections.len(), 1);
        assert_eq!(out.sections[0].as_bytes(), sect.as_bytes());
        assert_eq!(out.sections[0].source_pid(), 0x100);
        // A short section is also a complete single-section table.
        assert_eq!(out.tables.len(), 1);
        assert!(!demux.status().has_errors());
    }

    #[test]
    fn test_unfiltered_pid_ignored() {
        let mut demux = demux_for(0x100);
        let mut out = Collector::default();
        let sect = Section::new_short(0x40, b"x").unwrap();

        demux.feed_packet(&psi_packet(0x200, 0, true, 0, sect.as_bytes()), &mut out);

        assert!(out.sections.is_empty());
        assert_eq!(demux.packet_count(), 1);
    }

    #[test]
    fn test_two_sections_one_packet_then_stuffing() {
        let mut demux = demux_for(0x100);
        let mut out = Collector::default();
        let a = Section::new_short(0x40, b"first").unwrap();
        let b = Section::new_short(0x41, b"second").unwrap();

        let mut data = a.as_bytes().to_vec();
        data.extend_from_slice(b.as_bytes());
        demux.feed_packet(&psi_packet(0x100, 0, true, 0, &data), &mut out);

        assert_eq!(out.sections.len(), 2);
        assert_eq!(out.sections[0].table_id(), 0x40);
        assert_eq!(out.sections[1].table_id(), 0x41);
        // Stuffing consumed the remainder: the next packet can start fresh.
        demux.feed_packet(
            &psi_packet(0x100, 1, true, 0, a.as_bytes()),
            &mut out,
        );
        assert_eq!(out.sections.len(), 3);
        assert!(!demux.status().has_errors());
    }

    #[test]
    fn test_pes_payload_rejected() {
        let mut demux = demux_for(0x100);
        let mut out = Collector::default();

        // PES start code prefix as first payload bytes.
        demux.feed_packet(
            &psi_packet(0x100, 0, true, 0, &[0x00, 0x01, 0xE0, 0x00]),
            &mut out,
        );
        // Manually build: first three payload bytes must be 00 00 01.
        let pes = TsPacketBuilder::payload_only(0x100, 1)
            .pusi(true)
            .push(&[0x00, 0x00, 0x01, 0xE0])
            .build();
        demux.feed_packet(&pes, &mut out);

        assert!(out.sections.is_empty());
        // Continuation data afterwards is ignored until a clean unit start.
        demux.feed_packet(&psi_packet(0x100, 2, false, 0, &[0xAB; 100]), &mut out);
        assert!(out.sections.is_empty());

        let sect = Section::new_short(0x40, b"ok").unwrap();
        demux.feed_packet(&psi_packet(0x100, 3, true, 0, sect.as_bytes()), &mut out);
        assert_eq!(out.sections.len(), 1);
    }

    #[test]
    fn test_pointer_field_out_of_bounds_loses_sync() {
        let mut demux = demux_for(0x100);
        let mut out = Collector::default();

        // pointer_field == payload size (183): inconsistent by the strict rule.
        let pkt = TsPacketBuilder::payload_only(0x100, 0)
            .pusi(true)
            .push(&[183])
            .build();
        demux.feed_packet(&pkt, &mut out);
        assert!(out.sections.is_empty());

        let sect = Section::new_short(0x40, b"ok").unwrap();
        demux.feed_packet(&psi_packet(0x100, 1, true, 0, sect.as_bytes()), &mut out);
        assert_eq!(out.sections.len(), 1);
    }

    #[test]
    fn test_section_spanning_packets() {
        let mut demux = demux_for(0x100);
        let mut out = Collector::default();
        let sect = Section::new_long(0x42, 7, 0, true, 0, 0, &[0x55; 300]).unwrap();
        let bytes = sect.as_bytes();

        demux.feed_packet(&psi_packet(0x100, 0, true, 0, &bytes[..183]), &mut out);
        assert!(out.sections.is_empty());
        demux.feed_packet(&psi_packet(0x100, 1, false, 0, &bytes[183..]), &mut out);

        assert_eq!(out.sections.len(), 1);
        assert_eq!(out.sections[0].as_bytes(), bytes);
        assert_eq!(out.sections[0].first_pkt_index(), 0);
        assert_eq!(out.sections[0].last_pkt_index(), 1);
    }

    #[test]
    fn test_truncated_section_detected() {
        let mut demux = demux_for(0x100);
        let mut out = Collector::default();

        // Section A claims 400 bytes but the stream switches to section B
        // after 377: the unit start of the third packet points into A.
        let mut a_head = vec![0x40, 0x31, 0x8D]; // short header, length 397 + 3 = 400
        a_head.resize(183, 0xAA);
        demux.feed_packet(&psi_packet(0x100, 0, true, 0, &a_head), &mut out);
        demux.feed_packet(&psi_packet(0x100, 1, false, 0, &[0xAA; 184]), &mut out);

        let b = Section::new_short(0x41, b"survivor").unwrap();
        let mut tail = vec![0xAA; 10];
        tail.extend_from_slice(b.as_bytes());
        demux.feed_packet(&psi_packet(0x100, 2, true, 10, &tail), &mut out);

        // A was dropped without a handler call, B parsed correctly.
        assert_eq!(out.sections.len(), 1);
        assert_eq!(out.sections[0].table_id(), 0x41);
        assert_eq!(out.sections[0].payload(), b"survivor");
    }

    #[test]
    fn test_wrong_crc_counted_not_delivered() {
        let mut demux = demux_for(0x100);
        let mut out = Collector::default();
        let sect = Section::new_long(0x42, 1, 0, true, 0, 0, &[1, 2, 3]).unwrap();
        let mut raw = sect.as_bytes().to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;

        demux.feed_packet(&psi_packet(0x100, 0, true, 0, &raw), &mut out);

        assert!(out.sections.is_empty());
        assert_eq!(demux.status().wrong_crc, 1);
    }

    #[test]
    fn test_next_sections_suppressed() {
        let mut demux = demux_for(0x100);
        let mut out = Collector::default();
        let sect = Section::new_long(0x42, 1, 0, false, 0, 0, &[9; 4]).unwrap();

        demux.feed_packet(&psi_packet(0x100, 0, true, 0, sect.as_bytes()), &mut out);

        assert!(out.sections.is_empty());
        assert!(!demux.status().has_errors());
    }

    #[test]
    fn test_multi_section_table_assembly() {
        let mut demux = demux_for(0x100);
        let mut out = Collector::default();
        let s0 = Section::new_long(0x42, 5, 3, true, 0, 1, &[0; 8]).unwrap();
        let s1 = Section::new_long(0x42, 5, 3, true, 1, 1, &[1; 8]).unwrap();

        demux.feed_packet(&psi_packet(0x100, 0, true, 0, s0.as_bytes()), &mut out);
        assert!(out.tables.is_empty());
        demux.feed_packet(&psi_packet(0x100, 1, true, 0, s1.as_bytes()), &mut out);

        assert_eq!(out.tables.len(), 1);
        let table = &out.tables[0];
        assert_eq!(table.section_count(), 2);
        assert_eq!(table.version(), 3);
        // Round-trip: the table re-serializes to the exact input sections.
        let mut expected = s0.as_bytes().to_vec();
        expected.extend_from_slice(s1.as_bytes());
        assert_eq!(table.serialize(), expected);
    }

    #[test]
    fn test_version_change_resets_slots() {
        let mut demux = demux_for(0x100);
        let mut out = Collector::default();
        let v1s0 = Section::new_long(0x42, 5, 1, true, 0, 1, &[0; 4]).unwrap();
        let v2s0 = Section::new_long(0x42, 5, 2, true, 0, 1, &[2; 4]).unwrap();
        let v2s1 = Section::new_long(0x42, 5, 2, true, 1, 1, &[3; 4]).unwrap();

        demux.feed_packet(&psi_packet(0x100, 0, true, 0, v1s0.as_bytes()), &mut out);
        demux.feed_packet(&psi_packet(0x100, 1, true, 0, v2s0.as_bytes()), &mut out);
        demux.feed_packet(&psi_packet(0x100, 2, true, 0, v2s1.as_bytes()), &mut out);

        // Only version 2 completed; version 1's lone section was discarded.
        assert_eq!(out.tables.len(), 1);
        assert_eq!(out.tables[0].version(), 2);
    }

    #[test]
    fn test_duplicate_packet_dropped() {
        let mut demux = demux_for(0x100);
        let mut out = Collector::default();
        let sect = Section::new_short(0x40, b"dup").unwrap();
        let pkt = psi_packet(0x100, 4, true, 0, sect.as_bytes());

        demux.feed_packet(&pkt, &mut out);
        demux.feed_packet(&pkt, &mut out);

        assert_eq!(out.sections.len(), 1);
        assert_eq!(demux.status().discontinuities, 0);
    }

    #[test]
    fn test_discontinuity_loses_sync_until_pusi() {
        let mut demux = demux_for(0x100);
        let mut out = Collector::default();
        let long = Section::new_long(0x42, 7, 0, true, 0, 0, &[0x55; 300]).unwrap();
        let bytes = long.as_bytes();

        demux.feed_packet(&psi_packet(0x100, 0, true, 0, &bytes[..183]), &mut out);
        // CC jump: 0 -> 2.
        demux.feed_packet(&psi_packet(0x100, 2, false, 0, &bytes[183..]), &mut out);
        assert!(out.sections.is_empty());
        assert_eq!(demux.status().discontinuities, 1);

        // The next delivered section starts at a unit start boundary.
        let short = Section::new_short(0x40, b"after").unwrap();
        demux.feed_packet(&psi_packet(0x100, 3, true, 0, short.as_bytes()), &mut out);
        assert_eq!(out.sections.len(), 1);
        assert_eq!(out.sections[0].payload(), b"after");
    }

    #[test]
    fn test_scrambled_packet_counted() {
        let mut demux = demux_for(0x100);
        let mut out = Collector::default();
        let sect = Section::new_short(0x40, b"x").unwrap();
        let mut pkt = psi_packet(0x100, 0, true, 0, sect.as_bytes());
        pkt.set_scrambling_control(crate::packet::SC_EVEN_KEY);

        demux.feed_packet(&pkt, &mut out);

        assert!(out.sections.is_empty());
        assert_eq!(demux.status().scrambled, 1);
    }

    #[test]
    fn test_invalid_sync_counted() {
        let mut demux = demux_for(0x100);
        let mut out = Collector::default();
        let mut raw = [0u8; PKT_SIZE];
        raw[0] = 0x42;
        raw[1] = 0x01;
        raw[2] = 0x00;
        let pkt = TsPacket::from_bytes(&raw).unwrap();

        demux.feed_packet(&pkt, &mut out);
        assert_eq!(demux.status().invalid_ts, 1);
    }

    #[test]
    fn test_handler_reset_abandons_packet() {
        let mut demux = demux_for(0x100);
        let mut out = Collector {
            reset_pid_on_section: Some(0x100),
            ..Default::default()
        };
        let a = Section::new_short(0x40, b"first").unwrap();
        let b = Section::new_short(0x41, b"second").unwrap();
        let mut data = a.as_bytes().to_vec();
        data.extend_from_slice(b.as_bytes());

        demux.feed_packet(&psi_packet(0x100, 0, true, 0, &data), &mut out);

        // The handler reset its own PID after the first section: the second
        // section in the same packet is abandoned.
        assert_eq!(out.sections.len(), 1);
    }

    #[test]
    fn test_invalid_section_length_counted() {
        let mut demux = demux_for(0x100);
        let mut out = Collector::default();
        // Long-form header claiming a 4-byte total section.
        demux.feed_packet(&psi_packet(0x100, 0, true, 0, &[0x42, 0xB0, 0x01]), &mut out);
        assert_eq!(demux.status().inv_sect_length, 1);
        assert!(out.sections.is_empty());

        // Sync is lost; a clean unit start recovers.
        let sect = Section::new_short(0x40, b"ok").unwrap();
        demux.feed_packet(&psi_packet(0x100, 1, true, 0, sect.as_bytes()), &mut out);
        assert_eq!(out.sections.len(), 1);
    }

    #[test]
    fn test_section_number_above_last_counted() {
        let mut demux = demux_for(0x100);
        let mut out = Collector::default();
        // section_number 2 with last_section_number 1.
        let sect = Section::new_long(0x42, 1, 0, true, 2, 1, &[0; 4]).unwrap();
        demux.feed_packet(&psi_packet(0x100, 0, true, 0, sect.as_bytes()), &mut out);
        assert_eq!(demux.status().inv_sect_index, 1);
        assert!(out.sections.is_empty());
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut demux = demux_for(0x100);
        let mut out = Collector::default();
        demux.feed_packet(
            &psi_packet(0x100, 0, true, 0, &[0x42, 0xB0, 0x20, 0, 0]),
            &mut out,
        );
        demux.reset();
        demux.reset();
        demux.reset_pid(0x1234); // unknown PID: no-op
        assert_eq!(demux.status().invalid_ts, 0);
    }
}
