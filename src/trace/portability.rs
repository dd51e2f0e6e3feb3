//! Portability table: file offsets of memory-relevant packets.
//!
//! On disk the table is the last packet of the file. Its body holds the k
//! offsets followed by one more u64 equal to k, so the final 8 bytes of a
//! finalized trace always give the entry count. The count does not include
//! itself.

use crate::error::CaptureError;
use crate::trace::packet::{PacketKind, TracePacket, TracePacketHeader, PACKET_HEADER_SIZE};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortabilityTable {
    offsets: Vec<u64>,
}

impl PortabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, offset: u64) {
        self.offsets.push(offset);
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    pub fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity((self.offsets.len() + 1) * 8);
        for offset in &self.offsets {
            body.extend_from_slice(&offset.to_le_bytes());
        }
        body.extend_from_slice(&(self.offsets.len() as u64).to_le_bytes());
        body
    }

    /// Builds the trailing table packet.
    pub fn to_packet(&self, global_packet_index: u64, tracer_id: u8, now: u64) -> TracePacket {
        let header = TracePacketHeader {
            global_packet_index,
            tracer_id,
            packet_id: PacketKind::PORTABILITY_TABLE,
            vktrace_begin_time: now,
            entrypoint_begin_time: now,
            entrypoint_end_time: now,
            vktrace_end_time: now,
            ..Default::default()
        };
        TracePacket::new(header, self.encode_body())
    }

    pub fn decode_body(body: &[u8]) -> Result<Self, CaptureError> {
        if body.len() < 8 || body.len() % 8 != 0 {
            return Err(CaptureError::InvalidTrace(format!(
                "portability table body of {} bytes is not a u64 array",
                body.len()
            )));
        }
        let words: Vec<u64> = body
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        let (count, offsets) = (words[words.len() - 1], &words[..words.len() - 1]);
        if count != offsets.len() as u64 {
            return Err(CaptureError::InvalidTrace(format!(
                "portability table count {} disagrees with {} entries",
                count,
                offsets.len()
            )));
        }
        Ok(PortabilityTable {
            offsets: offsets.to_vec(),
        })
    }
}

/// Size of the trailing table packet for a table of `entries` offsets.
pub fn table_packet_size(entries: u64) -> u64 {
    PACKET_HEADER_SIZE as u64 + (entries + 1) * 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_word_counts_entries_only() {
        let mut table = PortabilityTable::new();
        table.push(112);
        table.push(400);
        table.push(913);
        let packet = table.to_packet(10, 2, 0);
        assert_eq!(packet.header.size, table_packet_size(3));
        assert_eq!(packet.header.packet_id, PacketKind::PORTABILITY_TABLE);

        let bytes = packet.encode();
        let tail = &bytes[bytes.len() - 8..];
        assert_eq!(u64::from_le_bytes(tail.try_into().unwrap()), 3);
        assert_eq!(PortabilityTable::decode_body(&packet.body).unwrap(), table);
    }

    #[test]
    fn test_empty_table() {
        let table = PortabilityTable::new();
        assert_eq!(table.encode_body(), 0u64.to_le_bytes().to_vec());
        assert!(PortabilityTable::decode_body(&table.encode_body())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_decode_rejects_inconsistent_count() {
        let mut body = 5u64.to_le_bytes().to_vec();
        body.extend_from_slice(&2u64.to_le_bytes());
        assert!(PortabilityTable::decode_body(&body).is_err());
        assert!(PortabilityTable::decode_body(&[0u8; 3]).is_err());
    }
}
