//! Shared constants for the trace file format and the capture transport.

/// Identifies a vktrace trace file. Stored in the first 8 bytes.
pub const TRACE_FILE_MAGIC: u64 = 0xABAD_D068_ADEA_FD0C;

/// Layout version of [`crate::trace::TraceFileHeader`] and the packet stream.
pub const TRACE_FILE_VERSION: u32 = 6;

/// Port of tracer 0; each tracer listens on `BASE_PORT + tracer_id`.
pub const BASE_PORT: u16 = 34199;

/// Upper bound on tracers recorded into a single file.
pub const MAX_TRACERS_PER_FILE: usize = 2;

pub const TRACER_ID_RESERVED: u8 = 0;
pub const TRACER_ID_GL_FPS: u8 = 1;
pub const TRACER_ID_VULKAN: u8 = 2;

/// Largest GPU-info array a stream header may announce.
pub const MAX_GPU_INFO: u32 = 64;

/// Default limit on a single incoming packet frame.
pub const DEFAULT_MAX_PACKET_SIZE: u64 = 256 * 1024 * 1024;

/// Port a tracer connects to.
pub const fn tracer_port(base_port: u16, tracer_id: u8) -> u16 {
    base_port.wrapping_add(tracer_id as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracer_port() {
        assert_eq!(tracer_port(BASE_PORT, TRACER_ID_VULKAN), 34201);
        assert_eq!(tracer_port(40000, TRACER_ID_RESERVED), 40000);
    }
}
