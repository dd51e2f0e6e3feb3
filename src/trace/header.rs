//! The trace-file header and the GPU-info array that follows it.
//!
//! Layout (little endian, 80 bytes):
//!
//! ```text
//!  0 magic u64               8 version u32           12 portability_table_valid u8
//! 13 endianness u8          14 pointer_size u8       15 tracer_count u8
//! 16 uuid [u8; 16]          32 first_packet_offset u64
//! 40 tracer_id_array 2 x (id u8, is_64_bit u8)       44 reserved u32
//! 48 trace_start_time u64   56 arch u64              64 os u64
//! 72 n_gpuinfo u32          76 reserved u32
//! ```

use serde::Serialize;

use crate::error::CaptureError;
use crate::trace::codec::{pack_tag, unpack_tag, FieldReader};
use crate::trace::constants::{
    MAX_GPU_INFO, MAX_TRACERS_PER_FILE, TRACE_FILE_MAGIC, TRACE_FILE_VERSION,
};

pub const TRACE_FILE_HEADER_SIZE: usize = 80;
pub const GPU_INFO_SIZE: usize = 16;

/// Byte offset of the portability flag, patched in place after finalization.
pub const PORTABILITY_VALID_OFFSET: u64 = 12;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TracerInfo {
    pub id: u8,
    pub is_64_bit: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GpuInfo {
    pub gpu_id: u64,
    pub driver_version: u64,
}

impl GpuInfo {
    pub fn encode(&self) -> [u8; GPU_INFO_SIZE] {
        let mut out = [0u8; GPU_INFO_SIZE];
        out[..8].copy_from_slice(&self.gpu_id.to_le_bytes());
        out[8..].copy_from_slice(&self.driver_version.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CaptureError> {
        let mut r = FieldReader::new(bytes, "gpu info");
        Ok(GpuInfo {
            gpu_id: r.u64()?,
            driver_version: r.u64()?,
        })
    }
}

/// Describes the machine that produced the trace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlatformInfo {
    /// 0 = little endian, 1 = big endian
    pub endianness: u8,
    pub pointer_size: u8,
    pub arch: String,
    pub os: String,
}

impl PlatformInfo {
    pub fn current() -> Self {
        PlatformInfo {
            endianness: if cfg!(target_endian = "big") { 1 } else { 0 },
            pointer_size: std::mem::size_of::<usize>() as u8,
            arch: std::env::consts::ARCH.to_string(),
            os: std::env::consts::OS.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TraceFileHeader {
    pub magic: u64,
    pub version: u32,
    pub portability_table_valid: bool,
    pub platform: PlatformInfo,
    pub uuid: [u8; 16],
    pub first_packet_offset: u64,
    pub tracers: Vec<TracerInfo>,
    pub trace_start_time: u64,
    pub n_gpuinfo: u32,
}

impl TraceFileHeader {
    /// A header for a new trace with the given tracers and GPU count.
    pub fn new(tracers: Vec<TracerInfo>, n_gpuinfo: u32, trace_start_time: u64) -> Self {
        TraceFileHeader {
            magic: TRACE_FILE_MAGIC,
            version: TRACE_FILE_VERSION,
            portability_table_valid: false,
            platform: PlatformInfo::current(),
            uuid: rand::random(),
            first_packet_offset: expected_first_packet_offset(n_gpuinfo),
            tracers,
            trace_start_time,
            n_gpuinfo,
        }
    }

    pub fn encode(&self) -> [u8; TRACE_FILE_HEADER_SIZE] {
        let mut out = Vec::with_capacity(TRACE_FILE_HEADER_SIZE);
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.push(self.portability_table_valid as u8);
        out.push(self.platform.endianness);
        out.push(self.platform.pointer_size);
        out.push(self.tracers.len().min(MAX_TRACERS_PER_FILE) as u8);
        out.extend_from_slice(&self.uuid);
        out.extend_from_slice(&self.first_packet_offset.to_le_bytes());
        for slot in 0..MAX_TRACERS_PER_FILE {
            let tracer = self.tracers.get(slot).copied().unwrap_or_default();
            out.push(tracer.id);
            out.push(tracer.is_64_bit as u8);
        }
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&self.trace_start_time.to_le_bytes());
        out.extend_from_slice(&pack_tag(&self.platform.arch).to_le_bytes());
        out.extend_from_slice(&pack_tag(&self.platform.os).to_le_bytes());
        out.extend_from_slice(&self.n_gpuinfo.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());

        let mut fixed = [0u8; TRACE_FILE_HEADER_SIZE];
        fixed.copy_from_slice(&out);
        fixed
    }

    /// Decode without judging magic or version; see [`Self::decode`].
    pub fn decode_unchecked(bytes: &[u8]) -> Result<Self, CaptureError> {
        let mut r = FieldReader::new(bytes, "trace file header");
        let magic = r.u64()?;
        let version = r.u32()?;
        let portability_table_valid = r.u8()? != 0;
        let endianness = r.u8()?;
        let pointer_size = r.u8()?;
        let tracer_count = r.u8()? as usize;
        let uuid = r.take::<16>()?;
        let first_packet_offset = r.u64()?;
        let mut tracers = Vec::with_capacity(MAX_TRACERS_PER_FILE);
        for _ in 0..MAX_TRACERS_PER_FILE {
            let id = r.u8()?;
            let is_64_bit = r.u8()? != 0;
            tracers.push(TracerInfo { id, is_64_bit });
        }
        tracers.truncate(tracer_count.min(MAX_TRACERS_PER_FILE));
        r.u32()?;
        let trace_start_time = r.u64()?;
        let arch = unpack_tag(r.u64()?);
        let os = unpack_tag(r.u64()?);
        let n_gpuinfo = r.u32()?;
        r.u32()?;

        Ok(TraceFileHeader {
            magic,
            version,
            portability_table_valid,
            platform: PlatformInfo {
                endianness,
                pointer_size,
                arch,
                os,
            },
            uuid,
            first_packet_offset,
            tracers,
            trace_start_time,
            n_gpuinfo,
        })
    }

    /// Decode a header read from a trace file. Files with an unknown magic or
    /// version are refused instead of being interpreted with a guessed layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, CaptureError> {
        let header = Self::decode_unchecked(bytes)?;
        if header.magic != TRACE_FILE_MAGIC {
            return Err(CaptureError::InvalidTrace(format!(
                "bad magic {:#018x}",
                header.magic
            )));
        }
        if header.version != TRACE_FILE_VERSION {
            return Err(CaptureError::InvalidTrace(format!(
                "unsupported trace file version {} (this build reads version {})",
                header.version, TRACE_FILE_VERSION
            )));
        }
        Ok(header)
    }

    /// Checks a header received from a tracer before anything is written.
    ///
    /// Any disagreement means the tracer was built against a different header
    /// layout, so it is reported as [`CaptureError::VersionSkew`].
    pub fn validate_stream_layout(&self) -> Result<(), CaptureError> {
        if self.magic != TRACE_FILE_MAGIC {
            return Err(CaptureError::version_skew(
                format!("magic {TRACE_FILE_MAGIC:#018x}"),
                format!("magic {:#018x}", self.magic),
            ));
        }
        if self.version != TRACE_FILE_VERSION {
            return Err(CaptureError::version_skew(
                format!("version {TRACE_FILE_VERSION}"),
                format!("version {}", self.version),
            ));
        }
        if self.n_gpuinfo > MAX_GPU_INFO {
            return Err(CaptureError::version_skew(
                format!("at most {MAX_GPU_INFO} gpu info records"),
                format!("{} gpu info records", self.n_gpuinfo),
            ));
        }
        let expected = expected_first_packet_offset(self.n_gpuinfo);
        if self.first_packet_offset != expected {
            return Err(CaptureError::version_skew(
                format!("{expected} header bytes"),
                format!("{} header bytes", self.first_packet_offset),
            ));
        }
        Ok(())
    }
}

/// Header size plus `n_gpuinfo` GPU-info records.
pub fn expected_first_packet_offset(n_gpuinfo: u32) -> u64 {
    TRACE_FILE_HEADER_SIZE as u64 + n_gpuinfo as u64 * GPU_INFO_SIZE as u64
}
