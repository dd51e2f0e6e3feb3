//! Common test utilities for vktrace-capture integration tests.

use std::fs::File;
use std::net::TcpListener;
use std::path::Path;

use vktrace_capture::trace::{TracePacket, TraceReader};

/// A base port whose listener port for `tracer_id` is currently free.
pub fn free_base_port(tracer_id: u8) -> u16 {
    loop {
        let socket = TcpListener::bind("127.0.0.1:0").expect("Failed to bind port scan socket");
        let port = socket.local_addr().unwrap().port();
        if port > tracer_id as u16 {
            return port - tracer_id as u16;
        }
    }
}

/// Opens a finished trace and reads every packet with its file offset.
#[allow(dead_code)]
pub fn read_trace(path: &Path) -> (TraceReader<File>, Vec<(u64, TracePacket)>) {
    let file = File::open(path).expect("Failed to open trace");
    let mut reader = TraceReader::open(file).expect("Failed to parse trace");
    let mut packets = Vec::new();
    while let Some(entry) = reader.next_packet().expect("Failed to read packet") {
        packets.push(entry);
    }
    (reader, packets)
}
