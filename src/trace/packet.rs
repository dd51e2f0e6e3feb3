//! Trace packets: a fixed 72-byte header followed by an opaque body.
//!
//! The capture transport never interprets entrypoint packets. It only needs
//! the marker kinds below and the set of kinds whose file offsets go into the
//! portability table.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::error::CaptureError;
use crate::trace::codec::FieldReader;

pub const PACKET_HEADER_SIZE: usize = 72;

/// Opaque packet discriminator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PacketKind(pub u16);

impl PacketKind {
    pub const MESSAGE: PacketKind = PacketKind(0);
    pub const MARKER_CHECKPOINT: PacketKind = PacketKind(1);
    pub const MARKER_API_BOUNDARY: PacketKind = PacketKind(2);
    pub const MARKER_API_GROUP_BEGIN: PacketKind = PacketKind(3);
    pub const MARKER_API_GROUP_END: PacketKind = PacketKind(4);
    pub const MARKER_TERMINATE_PROCESS: PacketKind = PacketKind(5);
    pub const PORTABILITY_TABLE: PacketKind = PacketKind(6);
    /// First id handed to API entrypoints by the entrypoint codec.
    pub const BEGIN_API_HERE: PacketKind = PacketKind(7);

    pub const fn api(offset: u16) -> PacketKind {
        PacketKind(Self::BEGIN_API_HERE.0 + offset)
    }

    pub fn marker_name(self) -> Option<&'static str> {
        Some(match self {
            Self::MESSAGE => "message",
            Self::MARKER_CHECKPOINT => "checkpoint",
            Self::MARKER_API_BOUNDARY => "api_boundary",
            Self::MARKER_API_GROUP_BEGIN => "api_group_begin",
            Self::MARKER_API_GROUP_END => "api_group_end",
            Self::MARKER_TERMINATE_PROCESS => "terminate_process",
            Self::PORTABILITY_TABLE => "portability_table",
            _ => return None,
        })
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.marker_name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "api#{}", self.0 - Self::BEGIN_API_HERE.0),
        }
    }
}

/// Entrypoint ids (relative to [`PacketKind::BEGIN_API_HERE`]) that allocate,
/// bind or free memory-backed objects. These match the entrypoint codec's
/// numbering and can be overridden from the command line.
pub mod api {
    use super::PacketKind;

    pub const ALLOCATE_MEMORY: PacketKind = PacketKind::api(23);
    pub const FREE_MEMORY: PacketKind = PacketKind::api(24);
    pub const BIND_BUFFER_MEMORY: PacketKind = PacketKind::api(29);
    pub const BIND_IMAGE_MEMORY: PacketKind = PacketKind::api(30);
    pub const CREATE_BUFFER: PacketKind = PacketKind::api(46);
    pub const DESTROY_BUFFER: PacketKind = PacketKind::api(47);
    pub const CREATE_IMAGE: PacketKind = PacketKind::api(50);
    pub const DESTROY_IMAGE: PacketKind = PacketKind::api(51);
}

pub fn default_portability_kinds() -> BTreeSet<PacketKind> {
    [
        api::ALLOCATE_MEMORY,
        api::FREE_MEMORY,
        api::BIND_BUFFER_MEMORY,
        api::BIND_IMAGE_MEMORY,
        api::CREATE_BUFFER,
        api::DESTROY_BUFFER,
        api::CREATE_IMAGE,
        api::DESTROY_IMAGE,
    ]
    .into_iter()
    .collect()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TracePacketHeader {
    /// Header plus body, in bytes.
    pub size: u64,
    pub global_packet_index: u64,
    pub tracer_id: u8,
    pub packet_id: PacketKind,
    pub thread_id: u32,
    pub vktrace_begin_time: u64,
    pub entrypoint_begin_time: u64,
    pub entrypoint_end_time: u64,
    pub vktrace_end_time: u64,
    /// Offset of out-of-band buffers appended after the body, 0 if none.
    pub next_buffers_offset: u64,
    /// Offset of the body from the start of the packet, 0 if there is none.
    pub body_offset: u64,
}

impl TracePacketHeader {
    pub fn encode(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut out = [0u8; PACKET_HEADER_SIZE];
        out[0..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..16].copy_from_slice(&self.global_packet_index.to_le_bytes());
        out[16] = self.tracer_id;
        out[18..20].copy_from_slice(&self.packet_id.0.to_le_bytes());
        out[20..24].copy_from_slice(&self.thread_id.to_le_bytes());
        out[24..32].copy_from_slice(&self.vktrace_begin_time.to_le_bytes());
        out[32..40].copy_from_slice(&self.entrypoint_begin_time.to_le_bytes());
        out[40..48].copy_from_slice(&self.entrypoint_end_time.to_le_bytes());
        out[48..56].copy_from_slice(&self.vktrace_end_time.to_le_bytes());
        out[56..64].copy_from_slice(&self.next_buffers_offset.to_le_bytes());
        out[64..72].copy_from_slice(&self.body_offset.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CaptureError> {
        let mut r = FieldReader::new(bytes, "packet header");
        let size = r.u64()?;
        let global_packet_index = r.u64()?;
        let tracer_id = r.u8()?;
        r.u8()?;
        let packet_id = PacketKind(r.u16()?);
        let header = TracePacketHeader {
            size,
            global_packet_index,
            tracer_id,
            packet_id,
            thread_id: r.u32()?,
            vktrace_begin_time: r.u64()?,
            entrypoint_begin_time: r.u64()?,
            entrypoint_end_time: r.u64()?,
            vktrace_end_time: r.u64()?,
            next_buffers_offset: r.u64()?,
            body_offset: r.u64()?,
        };
        if header.size < PACKET_HEADER_SIZE as u64 {
            return Err(CaptureError::InvalidTrace(format!(
                "packet {} declares size {} below the {} byte header",
                header.global_packet_index, header.size, PACKET_HEADER_SIZE
            )));
        }
        Ok(header)
    }

    pub fn body_len(&self) -> u64 {
        self.size - PACKET_HEADER_SIZE as u64
    }
}

/// A packet header together with its body bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TracePacket {
    pub header: TracePacketHeader,
    pub body: Vec<u8>,
}

impl TracePacket {
    /// Builds a packet, filling in `size` and `body_offset` from `body`.
    pub fn new(mut header: TracePacketHeader, body: Vec<u8>) -> Self {
        header.size = (PACKET_HEADER_SIZE + body.len()) as u64;
        header.body_offset = if body.is_empty() {
            0
        } else {
            PACKET_HEADER_SIZE as u64
        };
        TracePacket { header, body }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKET_HEADER_SIZE + self.body.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.body);
        out
    }

    /// Decodes a whole packet. `bytes` must be exactly `header.size` long.
    pub fn decode(bytes: &[u8]) -> Result<Self, CaptureError> {
        let header = TracePacketHeader::decode(bytes)?;
        if header.size != bytes.len() as u64 {
            return Err(CaptureError::InvalidTrace(format!(
                "packet {} declares size {} but {} bytes were framed",
                header.global_packet_index,
                header.size,
                bytes.len()
            )));
        }
        Ok(TracePacket {
            header,
            body: bytes[PACKET_HEADER_SIZE..].to_vec(),
        })
    }
}

/// Body of a [`PacketKind::MESSAGE`] packet: `level u32 | length u32 | bytes`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MessageBody {
    pub level: u32,
    pub message: String,
}

impl MessageBody {
    pub fn encode(&self) -> Vec<u8> {
        let text = self.message.as_bytes();
        let mut out = Vec::with_capacity(8 + text.len());
        out.extend_from_slice(&self.level.to_le_bytes());
        out.extend_from_slice(&(text.len() as u32).to_le_bytes());
        out.extend_from_slice(text);
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self, CaptureError> {
        let mut r = FieldReader::new(body, "message body");
        let level = r.u32()?;
        let len = r.u32()? as usize;
        let text = body.get(8..8 + len).ok_or_else(|| {
            CaptureError::InvalidTrace(format!(
                "message body announces {len} bytes, has {}",
                body.len().saturating_sub(8)
            ))
        })?;
        Ok(MessageBody {
            level,
            message: String::from_utf8_lossy(text).into_owned(),
        })
    }
}
