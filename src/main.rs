use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vktrace_capture::trace::packet::PacketKind;
use vktrace_capture::{
    Config, Injector, LayerInjector, Orchestrator, PreloadInjector, Verbosity,
};

/// Launch a Vulkan application under vktrace and record its trace.
#[derive(Debug, Parser)]
#[command(name = "vktrace-capture", version)]
struct Command {
    /// Program to trace
    #[arg(short, long)]
    program: String,
    /// Arguments for the program, as one whitespace separated string
    #[arg(short, long)]
    arguments: Option<String>,
    /// Working directory for the program
    #[arg(short, long)]
    working_dir: Option<PathBuf>,
    /// Trace file to write
    #[arg(short, long, default_value = "vktrace_out.vktrace")]
    output: PathBuf,
    /// Frames to take screenshots of: 1,5,10 or start-count[-interval]
    #[arg(short, long)]
    screenshot_frames: Option<String>,
    /// Image format for screenshots
    #[arg(long)]
    screenshot_format: Option<String>,
    /// Print message packets sent by the tracer
    #[arg(long)]
    print_messages: bool,
    #[arg(short, long, value_enum, default_value_t = Verbosity::Warnings)]
    verbosity: Verbosity,
    /// Trim trigger: hotkey-<key>[-<frames>] or frames-<start>-<count>
    #[arg(short, long)]
    trim_trigger: Option<String>,
    /// Track persistently mapped buffers
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pmb: bool,
    /// Inject the tracer with LD_PRELOAD from this library instead of the layer
    #[arg(long)]
    preload: Option<PathBuf>,
    /// Port of tracer 0; each tracer listens on base port + tracer id
    #[arg(long, default_value_t = vktrace_capture::trace::BASE_PORT)]
    base_port: u16,
    /// Largest packet accepted from the tracer, in bytes
    #[arg(long, default_value_t = vktrace_capture::trace::DEFAULT_MAX_PACKET_SIZE)]
    max_packet_size: u64,
    /// Packet kind id whose offsets go into the portability table (repeatable)
    #[arg(long)]
    portability_kind: Vec<u16>,
    /// Extra program arguments after `--`
    #[arg(last = true)]
    trailing: Vec<String>,
}

impl Command {
    fn into_config(self) -> Config {
        let mut arguments: Vec<String> = self
            .arguments
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        arguments.extend(self.trailing);

        let mut config = Config {
            program: self.program,
            arguments,
            working_dir: self.working_dir,
            output: self.output,
            screenshot_frames: self.screenshot_frames,
            screenshot_format: self.screenshot_format,
            print_trace_messages: self.print_messages,
            verbosity: self.verbosity,
            trim_trigger: self.trim_trigger,
            track_persistent_mappings: self.pmb,
            preload: self.preload,
            base_port: self.base_port,
            max_packet_size: self.max_packet_size,
            ..Default::default()
        };
        if !self.portability_kind.is_empty() {
            config.portability_kinds = self.portability_kind.into_iter().map(PacketKind).collect();
        }
        config
    }
}

fn init_logging(verbosity: Verbosity) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.level_filter().to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let opts = Command::parse();
    init_logging(opts.verbosity);

    let config = opts.into_config();
    config.validate()?;

    let injector: Box<dyn Injector> = match &config.preload {
        Some(library) => Box::new(PreloadInjector::new(library)),
        None => Box::new(LayerInjector),
    };
    let orchestrator = Orchestrator::new(config, injector);

    // Forward Ctrl-C to the target and stop recording.
    // Ignore MultipleHandlers error (e.g., in test harnesses).
    let stop = orchestrator.stop_handle();
    let _ = ctrlc::set_handler(move || {
        stop.stop();
    });

    let report = orchestrator.run()?;
    let packets: u64 = report.summaries.iter().map(|s| s.packets_written).sum();
    if report.empty_trace {
        eprintln!(
            "No tracer connected; wrote empty trace {}",
            report.output.display()
        );
    } else {
        eprintln!(
            "Wrote {} packets to {}",
            packets,
            report.output.display()
        );
    }
    match report.exit_code {
        Some(code) => eprintln!("Traced command exited with code {code}"),
        None => eprintln!("Traced command exit code unknown"),
    }
    Ok(())
}
