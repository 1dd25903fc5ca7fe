//! Packet-framed transport stream input.

use std::io::Read;

use pipeline_common::PipelineError;
use tracing::warn;
use ts::{PKT_SIZE, SYNC_BYTE, TsPacket};

/// Iterator over the 188-byte packets of a byte stream.
///
/// The reader realigns on the 0x47 sync byte after junk or a partial
/// packet, so a capture that does not start on a packet boundary still
/// feeds the pipeline.
pub struct PacketReader<R> {
    inner: R,
    buf: [u8; PKT_SIZE],
    filled: usize,
    resynced: bool,
}

impl<R: Read> PacketReader<R> {
    pub fn new(inner: R) -> Self {
        PacketReader {
            inner,
            buf: [0; PKT_SIZE],
            filled: 0,
            resynced: false,
        }
    }
}

impl<R: Read> Iterator for PacketReader<R> {
    type Item = Result<TsPacket, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            while self.filled < PKT_SIZE {
                match self.inner.read(&mut self.buf[self.filled..]) {
                    Ok(0) => {
                        if self.filled != 0 {
                            warn!("discarding {} trailing bytes", self.filled);
                        }
                        return None;
                    }
                    Ok(n) => self.filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Some(Err(e.into())),
                }
            }

            if self.buf[0] == SYNC_BYTE {
                self.filled = 0;
                return Some(TsPacket::from_bytes(&self.buf).map_err(|e| {
                    PipelineError::InvalidData(e.to_string())
                }));
            }

            // Out of sync: drop bytes up to the next sync byte and refill.
            if !self.resynced {
                warn!("input lost packet sync, resynchronizing");
                self.resynced = true;
            }
            match memchr::memchr(SYNC_BYTE, &self.buf[1..]) {
                Some(pos) => {
                    self.buf.copy_within(pos + 1.., 0);
                    self.filled = PKT_SIZE - pos - 1;
                }
                None => self.filled = 0,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn packet_bytes(pid: u16) -> Vec<u8> {
        let mut pkt = TsPacket::null();
        pkt.set_pid(pid);
        pkt.as_bytes().to_vec()
    }

    #[test]
    fn test_reads_aligned_packets() {
        let mut data = packet_bytes(0x100);
        data.extend(packet_bytes(0x101));
        let packets: Vec<_> = PacketReader::new(Cursor::new(data))
            .map(|p| p.unwrap().pid())
            .collect();
        assert_eq!(packets, vec![0x100, 0x101]);
    }

    #[test]
    fn test_resyncs_on_leading_junk() {
        let mut data = vec![0x00, 0x12, 0x34];
        data.extend(packet_bytes(0x100));
        let packets: Vec<_> = PacketReader::new(Cursor::new(data))
            .map(|p| p.unwrap().pid())
            .collect();
        assert_eq!(packets, vec![0x100]);
    }

    #[test]
    fn test_discards_trailing_partial_packet() {
        let mut data = packet_bytes(0x100);
        data.extend_from_slice(&[0x47, 0x00, 0x01]);
        let packets: Vec<_> = PacketReader::new(Cursor::new(data))
            .map(|p| p.unwrap().pid())
            .collect();
        assert_eq!(packets, vec![0x100]);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(PacketReader::new(Cursor::new(Vec::new())).count(), 0);
    }
}
