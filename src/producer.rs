//! Tracer side of the transport.
//!
//! A [`TraceProducer`] connects to the capture host, sends the trace-file
//! header once, then streams packets. Packet indices are assigned under the
//! same lock that serializes writes to the socket, so the host always sees
//! them in increasing order no matter how many application threads record.

use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::error::CaptureError;
use crate::trace::header::{GpuInfo, TraceFileHeader};
use crate::trace::packet::{MessageBody, PacketKind, TracePacket, TracePacketHeader};
use crate::transport::{FileLike, MessageStream};
use crate::utils::{current_tid, monotonic_ns};

struct ProducerState {
    stream: MessageStream,
    next_index: u64,
}

pub struct TraceProducer {
    tracer_id: u8,
    state: Mutex<ProducerState>,
}

impl TraceProducer {
    /// Connects to the host listening on `port` and completes the handshake.
    pub fn connect(address: &str, port: u16, tracer_id: u8) -> Result<Self, CaptureError> {
        let stream = MessageStream::connect(address, port)?;
        debug!("tracer {} connected to {}:{}", tracer_id, address, port);
        Ok(TraceProducer {
            tracer_id,
            state: Mutex::new(ProducerState {
                stream,
                next_index: 0,
            }),
        })
    }

    /// Coalesces packets into a buffer of `capacity` bytes before sending.
    pub fn with_send_buffer(self, capacity: usize) -> Self {
        self.lock().stream.enable_send_buffer(capacity);
        self
    }

    fn lock(&self) -> MutexGuard<'_, ProducerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn tracer_id(&self) -> u8 {
        self.tracer_id
    }

    /// Sends the trace-file header and GPU infos. Must come before any packet.
    pub fn send_header(
        &self,
        header: &TraceFileHeader,
        gpu_info: &[GpuInfo],
    ) -> Result<(), CaptureError> {
        let mut state = self.lock();
        let mut socket = FileLike::Socket(&mut state.stream);
        socket.write_raw(&header.encode())?;
        for info in gpu_info {
            socket.write_raw(&info.encode())?;
        }
        Ok(())
    }

    /// Index the next packet will get.
    pub fn next_packet_index(&self) -> u64 {
        self.lock().next_index
    }

    /// Sends one packet and returns the index it was given.
    pub fn send_packet(&self, kind: PacketKind, body: Vec<u8>) -> Result<u64, CaptureError> {
        let begin = monotonic_ns();
        let mut state = self.lock();
        let index = state.next_index;
        let header = TracePacketHeader {
            global_packet_index: index,
            tracer_id: self.tracer_id,
            packet_id: kind,
            thread_id: current_tid(),
            vktrace_begin_time: begin,
            entrypoint_begin_time: begin,
            entrypoint_end_time: begin,
            vktrace_end_time: monotonic_ns(),
            ..Default::default()
        };
        let packet = TracePacket::new(header, body);
        FileLike::Socket(&mut state.stream).write(&packet.encode())?;
        state.next_index += 1;
        Ok(index)
    }

    /// Sends an already encoded frame payload without touching it.
    ///
    /// The producer's index counter does not advance.
    pub fn send_frame(&self, bytes: &[u8]) -> Result<(), CaptureError> {
        FileLike::Socket(&mut self.lock().stream).write(bytes)
    }

    pub fn send_message(&self, level: u32, text: &str) -> Result<u64, CaptureError> {
        let body = MessageBody {
            level,
            message: text.to_string(),
        };
        self.send_packet(PacketKind::MESSAGE, body.encode())
    }

    /// Tells the host the application is exiting and flushes everything.
    pub fn terminate(&self) -> Result<(), CaptureError> {
        self.send_packet(PacketKind::MARKER_TERMINATE_PROCESS, Vec::new())?;
        self.flush()
    }

    pub fn flush(&self) -> Result<(), CaptureError> {
        self.lock().stream.flush()
    }
}
