//! On-disk and on-wire trace data types.
//!
//! # Module Organization
//!
//! - [`constants`]: magic, version, ports and tracer ids
//! - [`header`]: the trace-file header and GPU-info records
//! - [`packet`]: packet headers, packet kinds and message bodies
//! - [`portability`]: the trailing portability table
//! - [`reader`]: reading a finished trace file back

pub mod constants;
pub mod header;
pub mod packet;
pub mod portability;
pub mod reader;

mod codec;

pub use constants::*;
pub use header::{GpuInfo, PlatformInfo, TraceFileHeader, TracerInfo};
pub use packet::{MessageBody, PacketKind, TracePacket, TracePacketHeader};
pub use portability::PortabilityTable;
pub use reader::TraceReader;
