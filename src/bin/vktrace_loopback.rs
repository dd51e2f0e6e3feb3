//! vktrace-loopback: synthetic tracer
//!
//! Connects to a capture host like the real tracer would and streams
//! generated packets. Run it as the traced program to exercise a whole
//! capture session without a Vulkan driver.

use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use vktrace_capture::environment::PORT_BASE_VAR;
use vktrace_capture::trace::packet::api;
use vktrace_capture::trace::{
    tracer_port, GpuInfo, PacketKind, TraceFileHeader, TracerInfo, BASE_PORT, TRACER_ID_VULKAN,
};
use vktrace_capture::utils::realtime_ns;
use vktrace_capture::TraceProducer;

/// Kinds the generator cycles through.
const KIND_CYCLE: &[PacketKind] = &[
    PacketKind::api(0),
    api::CREATE_BUFFER,
    api::ALLOCATE_MEMORY,
    api::BIND_BUFFER_MEMORY,
    PacketKind::api(120),
    PacketKind::MARKER_API_BOUNDARY,
    api::DESTROY_BUFFER,
    api::FREE_MEMORY,
];

#[derive(Debug, Parser)]
#[command(name = "vktrace-loopback", version)]
struct Command {
    /// Capture host address
    #[arg(long, default_value = "127.0.0.1")]
    address: String,
    /// Base port; defaults to VKTRACE_PORT_BASE or the standard port
    #[arg(long)]
    base_port: Option<u16>,
    #[arg(long, default_value_t = TRACER_ID_VULKAN)]
    tracer_id: u8,
    /// Packets per thread
    #[arg(short, long, default_value_t = 100)]
    packets: u32,
    /// Threads sending packets concurrently
    #[arg(short, long, default_value_t = 1)]
    threads: u32,
    /// Send a message packet every N packets (0 disables)
    #[arg(long, default_value_t = 25)]
    message_every: u32,
    /// Coalesce packets in a send buffer of this many bytes
    #[arg(long)]
    send_buffer: Option<usize>,
    /// Number of GPU info records in the header
    #[arg(long, default_value_t = 1)]
    gpus: u32,
    /// Close the connection without sending the terminate marker
    #[arg(long)]
    no_terminate: bool,
}

fn base_port(opts: &Command) -> Result<u16> {
    if let Some(port) = opts.base_port {
        return Ok(port);
    }
    match std::env::var(PORT_BASE_VAR) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("Invalid {PORT_BASE_VAR} '{value}'")),
        Err(_) => Ok(BASE_PORT),
    }
}

fn body_for(thread: u32, seq: u32) -> Vec<u8> {
    let len = (seq as usize * 13 + thread as usize * 7) % 96;
    (0..len).map(|i| (i as u32 ^ seq ^ thread) as u8).collect()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let opts = Command::parse();
    if opts.threads == 0 {
        bail!("--threads must be at least 1");
    }

    let port = tracer_port(base_port(&opts)?, opts.tracer_id);
    let mut producer = TraceProducer::connect(&opts.address, port, opts.tracer_id)
        .with_context(|| format!("Failed to reach capture host on port {port}"))?;
    if let Some(capacity) = opts.send_buffer {
        producer = producer.with_send_buffer(capacity);
    }
    let producer = Arc::new(producer);

    let gpu_info: Vec<GpuInfo> = (0..opts.gpus)
        .map(|i| GpuInfo {
            gpu_id: 0x1000 + i as u64,
            driver_version: 0x0001_0000 + i as u64,
        })
        .collect();
    let header = TraceFileHeader::new(
        vec![TracerInfo {
            id: opts.tracer_id,
            is_64_bit: cfg!(target_pointer_width = "64"),
        }],
        gpu_info.len() as u32,
        realtime_ns(),
    );
    producer.send_header(&header, &gpu_info)?;
    info!("connected on port {}", port);

    let workers = (0..opts.threads)
        .map(|t| {
            let producer = producer.clone();
            let packets = opts.packets;
            let message_every = opts.message_every;
            thread::Builder::new()
                .name(format!("loopback-{t}"))
                .spawn(move || -> Result<()> {
                    for seq in 0..packets {
                        if message_every != 0 && seq % message_every == 0 {
                            producer.send_message(3, &format!("thread {t} at packet {seq}"))?;
                        }
                        let kind = KIND_CYCLE[(seq as usize + t as usize) % KIND_CYCLE.len()];
                        producer.send_packet(kind, body_for(t, seq))?;
                    }
                    Ok(())
                })
                .context("Failed to spawn sender thread")
        })
        .collect::<Result<Vec<_>>>()?;
    for worker in workers {
        match worker.join() {
            Ok(result) => result?,
            Err(_) => bail!("sender thread panicked"),
        }
    }

    debug!("sent {} packets", producer.next_packet_index());
    if opts.no_terminate {
        producer.flush()?;
    } else {
        producer.terminate()?;
    }
    Ok(())
}
