use std::io::{self, Read, Seek, SeekFrom};

use crate::error::CaptureError;
use crate::trace::header::{GpuInfo, TraceFileHeader, GPU_INFO_SIZE, TRACE_FILE_HEADER_SIZE};
use crate::trace::packet::{PacketKind, TracePacket, TracePacketHeader, PACKET_HEADER_SIZE};
use crate::trace::portability::{table_packet_size, PortabilityTable};

/// Reads a finished trace file.
///
/// Length fields come from the file, so every offset is checked against the
/// file size before anything is allocated.
pub struct TraceReader<R> {
    reader: R,
    pub header: TraceFileHeader,
    pub gpu_info: Vec<GpuInfo>,
    /// Present when the header's portability flag is set.
    pub portability: Option<PortabilityTable>,
    file_len: u64,
    /// End of the packet stream (start of the portability packet when valid).
    packets_end: u64,
    cursor: u64,
}

impl<R: Read + Seek> TraceReader<R> {
    pub fn open(mut reader: R) -> Result<Self, CaptureError> {
        let file_len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let mut raw = [0u8; TRACE_FILE_HEADER_SIZE];
        read_exact_or_truncated(&mut reader, &mut raw, "trace file header")?;
        let header = TraceFileHeader::decode(&raw)?;
        if header.first_packet_offset > file_len {
            return Err(CaptureError::InvalidTrace(format!(
                "first packet offset {} is past the end of a {} byte file",
                header.first_packet_offset, file_len
            )));
        }

        let mut gpu_info = Vec::with_capacity(header.n_gpuinfo as usize);
        for _ in 0..header.n_gpuinfo {
            let mut raw = [0u8; GPU_INFO_SIZE];
            read_exact_or_truncated(&mut reader, &mut raw, "gpu info")?;
            gpu_info.push(GpuInfo::decode(&raw)?);
        }

        let mut packets_end = file_len;
        let mut portability = None;
        if header.portability_table_valid {
            let (start, table) = read_portability(&mut reader, &header, file_len)?;
            packets_end = start;
            portability = Some(table);
        }

        let cursor = header.first_packet_offset;
        Ok(TraceReader {
            reader,
            header,
            gpu_info,
            portability,
            file_len,
            packets_end,
            cursor,
        })
    }

    /// Returns the next packet with its file offset, or `None` at the end of
    /// the packet stream. The portability packet is not returned when the
    /// header marks it valid.
    pub fn next_packet(&mut self) -> Result<Option<(u64, TracePacket)>, CaptureError> {
        if self.cursor >= self.packets_end {
            return Ok(None);
        }
        let offset = self.cursor;
        self.reader.seek(SeekFrom::Start(offset))?;
        let mut raw = [0u8; PACKET_HEADER_SIZE];
        read_exact_or_truncated(&mut self.reader, &mut raw, "packet header")?;
        let header = TracePacketHeader::decode(&raw)?;
        let end = offset
            .checked_add(header.size)
            .filter(|end| *end <= self.packets_end)
            .ok_or_else(|| {
                CaptureError::InvalidTrace(format!(
                    "packet at offset {offset} with size {} runs past the packet stream",
                    header.size
                ))
            })?;
        let mut body = vec![0u8; header.body_len() as usize];
        read_exact_or_truncated(&mut self.reader, &mut body, "packet body")?;
        self.cursor = end;
        Ok(Some((offset, TracePacket { header, body })))
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }
}

fn read_portability<R: Read + Seek>(
    reader: &mut R,
    header: &TraceFileHeader,
    file_len: u64,
) -> Result<(u64, PortabilityTable), CaptureError> {
    if file_len < header.first_packet_offset + table_packet_size(0) {
        return Err(CaptureError::InvalidTrace(
            "portability flag set but the file has no table".to_string(),
        ));
    }
    reader.seek(SeekFrom::Start(file_len - 8))?;
    let mut word = [0u8; 8];
    reader.read_exact(&mut word)?;
    let entries = u64::from_le_bytes(word);

    let start = entries
        .checked_add(1)
        .and_then(|words| words.checked_mul(8))
        .and_then(|body| body.checked_add(PACKET_HEADER_SIZE as u64))
        .and_then(|size| file_len.checked_sub(size))
        .filter(|start| *start >= header.first_packet_offset)
        .ok_or_else(|| {
            CaptureError::InvalidTrace(format!(
                "portability table of {entries} entries does not fit in the file"
            ))
        })?;

    reader.seek(SeekFrom::Start(start))?;
    let mut raw = [0u8; PACKET_HEADER_SIZE];
    reader.read_exact(&mut raw)?;
    let packet_header = TracePacketHeader::decode(&raw)?;
    if packet_header.packet_id != PacketKind::PORTABILITY_TABLE {
        return Err(CaptureError::InvalidTrace(format!(
            "expected portability table at offset {start}, found {}",
            packet_header.packet_id
        )));
    }
    if packet_header.size != file_len - start {
        return Err(CaptureError::InvalidTrace(format!(
            "portability table at offset {start} declares {} bytes, {} remain in the file",
            packet_header.size,
            file_len - start
        )));
    }
    let mut body = vec![0u8; packet_header.body_len() as usize];
    reader.read_exact(&mut body)?;
    Ok((start, PortabilityTable::decode_body(&body)?))
}

fn read_exact_or_truncated<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<(), CaptureError> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            CaptureError::InvalidTrace(format!("{what} truncated"))
        } else {
            CaptureError::Io(e)
        }
    })
}
