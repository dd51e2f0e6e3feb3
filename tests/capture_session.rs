// End-to-end capture sessions.
//
// These launch real processes: /bin/true for a session where no tracer ever
// connects, and the vktrace-loopback binary as a synthetic tracer.

mod common;

use std::fs;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use common::{free_base_port, read_trace};
use vktrace_capture::trace::header::TRACE_FILE_HEADER_SIZE;
use vktrace_capture::trace::packet::default_portability_kinds;
use vktrace_capture::trace::{PacketKind, TraceFileHeader, TRACER_ID_VULKAN};
use vktrace_capture::{Config, EndReason, LayerInjector, Orchestrator};

fn loopback_config(dir: &TempDir, args: &[&str]) -> Config {
    Config {
        program: env!("CARGO_BIN_EXE_vktrace-loopback").to_string(),
        arguments: args.iter().map(|s| s.to_string()).collect(),
        output: dir.path().join("loopback.vktrace"),
        base_port: free_base_port(TRACER_ID_VULKAN),
        ..Default::default()
    }
}

#[test]
fn test_true_produces_valid_empty_trace() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("empty.vktrace");
    let port = free_base_port(TRACER_ID_VULKAN);

    let status = Command::new(env!("CARGO_BIN_EXE_vktrace-capture"))
        .args(["--program", "/bin/true", "--base-port"])
        .arg(port.to_string())
        .arg("--output")
        .arg(&output)
        .status()
        .expect("Failed to run vktrace-capture");
    assert!(status.success());

    let (reader, packets) = read_trace(&output);
    assert!(packets.is_empty());
    assert!(reader.header.tracers.is_empty());
    assert!(reader.header.portability_table_valid);
    assert!(reader.portability.as_ref().unwrap().is_empty());

    // The header re-encodes to the exact bytes on disk.
    let bytes = fs::read(&output).unwrap();
    let header = TraceFileHeader::decode(&bytes[..TRACE_FILE_HEADER_SIZE]).unwrap();
    assert_eq!(header.encode().as_slice(), &bytes[..TRACE_FILE_HEADER_SIZE]);
    assert_eq!(header, reader.header);
    assert_eq!(&bytes[bytes.len() - 8..], &0u64.to_le_bytes());
}

#[test]
fn test_loopback_session() {
    let dir = TempDir::new().unwrap();
    let config = loopback_config(
        &dir,
        &["--packets", "60", "--threads", "3", "--send-buffer", "4096", "--gpus", "2"],
    );
    let report = Orchestrator::new(config, Box::new(LayerInjector))
        .run()
        .expect("capture failed");

    assert_eq!(report.exit_code, Some(0));
    assert!(!report.empty_trace);
    let summary = &report.summaries[0];
    assert_eq!(summary.end, EndReason::TerminateMarker);
    // 60 packets and 3 messages from each of 3 threads.
    assert_eq!(summary.packets_written, 189);
    assert_eq!(summary.messages, 9);
    assert_eq!(summary.dropped, 0);
    assert!(summary.portability_valid);

    let (reader, packets) = read_trace(&report.output);
    assert_eq!(reader.gpu_info.len(), 2);
    assert_eq!(reader.header.tracers.len(), 1);

    // Indices are strictly increasing with no gaps.
    let indices: Vec<u64> = packets
        .iter()
        .map(|(_, p)| p.header.global_packet_index)
        .collect();
    assert_eq!(indices, (0..189).collect::<Vec<u64>>());

    // The table points at exactly the memory-relevant packets.
    let kinds = default_portability_kinds();
    let expected: Vec<u64> = packets
        .iter()
        .filter(|(_, p)| kinds.contains(&p.header.packet_id))
        .map(|(offset, _)| *offset)
        .collect();
    let table = reader.portability.as_ref().unwrap();
    assert!(!expected.is_empty());
    assert_eq!(table.offsets(), expected.as_slice());
    assert_eq!(summary.portability_entries, expected.len());

    let bytes = fs::read(&report.output).unwrap();
    let count = u64::from_le_bytes(bytes[bytes.len() - 8..].try_into().unwrap());
    assert_eq!(count, expected.len() as u64);

    assert!(packets
        .iter()
        .all(|(_, p)| p.header.packet_id != PacketKind::MARKER_TERMINATE_PROCESS));
}

#[test]
fn test_loopback_without_terminate_marker() {
    let dir = TempDir::new().unwrap();
    let config = loopback_config(&dir, &["--packets", "40", "--no-terminate"]);
    let report = Orchestrator::new(config, Box::new(LayerInjector))
        .run()
        .expect("capture failed");

    let summary = &report.summaries[0];
    assert!(matches!(
        summary.end,
        EndReason::ConnectionClosed | EndReason::Cancelled
    ));
    // 40 packets and 2 messages
    assert_eq!(summary.packets_written, 42);
    assert!(summary.portability_valid);
}

#[test]
fn test_stop_while_tracer_streams() {
    let dir = TempDir::new().unwrap();
    let config = loopback_config(&dir, &["--packets", "1000000000", "--threads", "2"]);
    let output = config.output.clone();
    let orchestrator = Orchestrator::new(config, Box::new(LayerInjector));
    let stop = orchestrator.stop_handle();

    let stopper = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !output.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(200));
        stop.stop()
    });

    let started = Instant::now();
    let report = orchestrator.run().expect("capture failed");
    assert!(stopper.join().unwrap());
    assert!(started.elapsed() < Duration::from_secs(30));

    assert_eq!(report.exit_code, Some(128 + libc::SIGINT));
    let summary = &report.summaries[0];
    assert_eq!(summary.end, EndReason::Cancelled);
    assert!(summary.packets_written > 0);
    assert!(summary.portability_valid);

    let (reader, packets) = read_trace(&report.output);
    assert!(reader.header.portability_table_valid);
    assert_eq!(packets.len() as u64, summary.packets_written);
    assert!(packets
        .windows(2)
        .all(|w| w[0].1.header.global_packet_index < w[1].1.header.global_packet_index));
}

#[test]
fn test_info_reads_captured_trace() {
    let dir = TempDir::new().unwrap();
    let config = loopback_config(&dir, &["--packets", "10", "--message-every", "0"]);
    let report = Orchestrator::new(config, Box::new(LayerInjector))
        .run()
        .expect("capture failed");

    let output = Command::new(env!("CARGO_BIN_EXE_vktrace-info"))
        .arg(&report.output)
        .arg("--json")
        .output()
        .expect("Failed to run vktrace-info");
    assert!(output.status.success());

    let info: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(info["packet_count"], 10);
    assert_eq!(info["first_index"], 0);
    assert_eq!(info["last_index"], 9);
    assert_eq!(info["header"]["version"], 6);
    assert!(info["portability"].is_array());
}

#[test]
fn test_missing_program_leaves_no_file() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("never.vktrace");

    let result = Command::new(env!("CARGO_BIN_EXE_vktrace-capture"))
        .args(["--program", "/nonexistent/vkcube", "--base-port"])
        .arg(free_base_port(TRACER_ID_VULKAN).to_string())
        .arg("--output")
        .arg(&output)
        .output()
        .expect("Failed to run vktrace-capture");

    assert!(!result.status.success());
    assert!(String::from_utf8_lossy(&result.stderr).contains("/nonexistent/vkcube"));
    assert!(!output.exists());
}
