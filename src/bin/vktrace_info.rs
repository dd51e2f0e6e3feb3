//! vktrace-info: summarize a captured trace file
//!
//! Prints the file header, GPU infos, packet counts per kind and the
//! portability table, as text or JSON.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use vktrace_capture::trace::{GpuInfo, TraceFileHeader, TraceReader};

#[derive(Parser)]
#[command(name = "vktrace-info")]
#[command(about = "Summarize a vktrace trace file")]
#[command(version)]
struct Cli {
    /// Trace file to read
    trace: PathBuf,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    /// Also list every packet with its offset
    #[arg(long)]
    packets: bool,
}

#[derive(Serialize)]
struct PacketEntry {
    offset: u64,
    index: u64,
    kind: String,
    size: u64,
    thread_id: u32,
}

#[derive(Serialize)]
struct TraceInfo {
    file_len: u64,
    header: TraceFileHeader,
    gpu_info: Vec<GpuInfo>,
    packet_count: u64,
    first_index: Option<u64>,
    last_index: Option<u64>,
    kinds: BTreeMap<String, u64>,
    /// `None` when the table was never finalized
    portability: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    packets: Vec<PacketEntry>,
}

fn collect(cli: &Cli) -> Result<TraceInfo> {
    let file = File::open(&cli.trace)
        .with_context(|| format!("Failed to open {}", cli.trace.display()))?;
    let mut reader = TraceReader::open(BufReader::new(file))
        .with_context(|| format!("Failed to read {}", cli.trace.display()))?;

    let mut kinds = BTreeMap::new();
    let mut packets = Vec::new();
    let mut packet_count = 0;
    let mut first_index = None;
    let mut last_index = None;
    while let Some((offset, packet)) = reader.next_packet()? {
        let header = packet.header;
        packet_count += 1;
        first_index.get_or_insert(header.global_packet_index);
        last_index = Some(header.global_packet_index);
        *kinds.entry(header.packet_id.to_string()).or_insert(0) += 1;
        if cli.packets {
            packets.push(PacketEntry {
                offset,
                index: header.global_packet_index,
                kind: header.packet_id.to_string(),
                size: header.size,
                thread_id: header.thread_id,
            });
        }
    }

    Ok(TraceInfo {
        file_len: reader.file_len(),
        portability: reader.portability.as_ref().map(|t| t.offsets().to_vec()),
        header: reader.header.clone(),
        gpu_info: reader.gpu_info.clone(),
        packet_count,
        first_index,
        last_index,
        kinds,
        packets,
    })
}

fn print_text(info: &TraceInfo) {
    let header = &info.header;
    println!("File size:        {} bytes", info.file_len);
    println!("Version:          {}", header.version);
    println!(
        "UUID:             {}",
        header
            .uuid
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>()
    );
    println!(
        "Platform:         {} {} ({}-bit pointers)",
        header.platform.os,
        header.platform.arch,
        header.platform.pointer_size as u32 * 8
    );
    println!("Start time:       {}", header.trace_start_time);
    println!("First packet at:  {}", header.first_packet_offset);
    let tracers: Vec<String> = header
        .tracers
        .iter()
        .map(|t| format!("{}{}", t.id, if t.is_64_bit { " (64-bit)" } else { "" }))
        .collect();
    println!("Tracers:          [{}]", tracers.join(", "));

    for (i, gpu) in info.gpu_info.iter().enumerate() {
        println!(
            "GPU {}:            id {:#x}, driver {:#x}",
            i, gpu.gpu_id, gpu.driver_version
        );
    }

    println!();
    match (info.first_index, info.last_index) {
        (Some(first), Some(last)) => println!(
            "{} packets, indices {}..={}",
            info.packet_count, first, last
        ),
        _ => println!("No packets"),
    }
    for (kind, count) in &info.kinds {
        println!("  {kind:<20} {count}");
    }

    println!();
    match &info.portability {
        Some(offsets) => {
            println!("Portability table: {} entries", offsets.len());
            for offset in offsets {
                println!("  {offset}");
            }
        }
        None => println!("Portability table: not valid"),
    }

    if !info.packets.is_empty() {
        println!();
        println!("{:>12} {:>10} {:<20} {:>10} {:>8}", "offset", "index", "kind", "size", "tid");
        for p in &info.packets {
            println!(
                "{:>12} {:>10} {:<20} {:>10} {:>8}",
                p.offset, p.index, p.kind, p.size, p.thread_id
            );
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let info = collect(&cli)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        print_text(&info);
    }
    Ok(())
}
