//! Capture recording thread.
//!
//! One recording thread serves one tracer. It accepts the tracer's
//! connection, validates the stream header, then writes every packet it
//! receives to the shared trace file in arrival order. When the tracer says
//! goodbye, the connection closes or the session is stopped, it appends the
//! portability table and marks it valid in the file header.

use std::fmt;
use std::sync::Arc;
use std::thread;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::CaptureError;
use crate::session::{CaptureThreadInfo, SessionState};
use crate::trace::header::{GpuInfo, TraceFileHeader, GPU_INFO_SIZE, TRACE_FILE_HEADER_SIZE};
use crate::trace::packet::{MessageBody, PacketKind, TracePacketHeader, PACKET_HEADER_SIZE};
use crate::trace::portability::PortabilityTable;
use crate::transport::{FileLike, MessageListener, MessageStream, FRAME_PREFIX_SIZE};
use crate::utils::monotonic_ns;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecorderState {
    AwaitConnection,
    Handshake,
    StreamHeader,
    Receiving,
    Finalizing,
    Terminated,
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecorderState::AwaitConnection => "await-connection",
            RecorderState::Handshake => "handshake",
            RecorderState::StreamHeader => "stream-header",
            RecorderState::Receiving => "receiving",
            RecorderState::Finalizing => "finalizing",
            RecorderState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Why a recording thread stopped receiving.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    /// The tracer sent a terminate marker.
    TerminateMarker,
    /// The tracer closed its connection.
    ConnectionClosed,
    /// The session was stopped. Data queued at the stop was drained, or the
    /// tracer hung up while stopping.
    Cancelled,
    /// The session stopped before any tracer connected.
    #[default]
    NoConnection,
    /// The connection failed with something other than a clean close.
    NetworkError,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecordingSummary {
    pub tracer_id: u8,
    pub packets_written: u64,
    pub messages: u64,
    /// Frames that were empty, malformed or out of order.
    pub dropped: u64,
    pub write_failures: u64,
    pub portability_entries: usize,
    pub portability_valid: bool,
    pub end: EndReason,
}

impl RecordingSummary {
    /// Whether this tracer created (or wrote into) the trace file.
    pub fn received_header(&self) -> bool {
        self.end != EndReason::NoConnection
    }
}

/// Starts the recording thread for `info`, consuming its listener.
pub fn spawn_recording_thread(info: &mut CaptureThreadInfo) -> Result<(), CaptureError> {
    let listener = info.listener.take().ok_or_else(|| {
        CaptureError::NetworkFailure(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            format!("no listener bound for tracer {}", info.tracer_id),
        ))
    })?;
    let tracer_id = info.tracer_id;
    let session = info.session.clone();
    let handle = thread::Builder::new()
        .name(format!("vktrace-record-{tracer_id}"))
        .spawn(move || record(listener, tracer_id, session))?;
    info.recording_thread = Some(handle);
    Ok(())
}

/// Runs a whole recording session on the calling thread.
pub fn record(
    listener: MessageListener,
    tracer_id: u8,
    session: Arc<SessionState>,
) -> Result<RecordingSummary, CaptureError> {
    let mut recorder = Recorder::new(tracer_id, &session);
    let result = recorder.run(&listener);
    recorder.transition(RecorderState::Terminated);
    result.map(|_| recorder.summary)
}

struct Recorder<'a> {
    session: &'a SessionState,
    state: RecorderState,
    portability: PortabilityTable,
    summary: RecordingSummary,
}

enum Flow {
    Continue,
    Stop,
}

impl<'a> Recorder<'a> {
    fn new(tracer_id: u8, session: &'a SessionState) -> Self {
        Recorder {
            session,
            state: RecorderState::AwaitConnection,
            portability: PortabilityTable::new(),
            summary: RecordingSummary {
                tracer_id,
                ..Default::default()
            },
        }
    }

    fn tracer_id(&self) -> u8 {
        self.summary.tracer_id
    }

    fn transition(&mut self, next: RecorderState) {
        if self.state != next {
            debug!("tracer {}: {} -> {}", self.tracer_id(), self.state, next);
            self.state = next;
        }
    }

    fn run(&mut self, listener: &MessageListener) -> Result<(), CaptureError> {
        let Some(mut stream) = listener.accept(&self.session.termination)? else {
            info!("no tracer connected on port {}", listener.port());
            self.summary.end = EndReason::NoConnection;
            return Ok(());
        };

        self.transition(RecorderState::Handshake);
        stream.handshake()?;

        self.transition(RecorderState::StreamHeader);
        match self.read_stream_header(&mut stream) {
            Ok(()) => {}
            Err(e) if e.is_clean_termination() => {
                warn!("tracer {} disconnected before sending a header", self.tracer_id());
                self.summary.end = EndReason::NoConnection;
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.transition(RecorderState::Receiving);
        self.receive(&mut stream);

        self.transition(RecorderState::Finalizing);
        self.finalize();
        Ok(())
    }

    fn read_stream_header(&mut self, stream: &mut MessageStream) -> Result<(), CaptureError> {
        let mut socket = FileLike::Socket(stream);
        let mut raw = [0u8; TRACE_FILE_HEADER_SIZE];
        socket.read_raw(&mut raw)?;
        let header = TraceFileHeader::decode_unchecked(&raw)?;
        header.validate_stream_layout()?;

        let mut gpu_info = Vec::with_capacity(header.n_gpuinfo as usize);
        let mut raw = [0u8; GPU_INFO_SIZE];
        for _ in 0..header.n_gpuinfo {
            socket.read_raw(&mut raw)?;
            gpu_info.push(GpuInfo::decode(&raw)?);
        }

        if self.session.trace_file.create(&header, &gpu_info)? {
            info!(
                "tracer {} started trace {}",
                self.tracer_id(),
                self.session.trace_file.path().display()
            );
        } else {
            debug!(
                "tracer {} appends to the existing trace file",
                self.tracer_id()
            );
        }
        Ok(())
    }

    fn receive(&mut self, stream: &mut MessageStream) {
        let max_packet_size = self.session.config.max_packet_size;
        // Bytes left to read once a stop has been seen; only what was queued
        // at that moment is drained.
        let mut drain: Option<usize> = None;
        loop {
            if drain.is_none() && self.session.termination.is_requested() {
                match stream.queued_bytes() {
                    Ok(queued) => {
                        debug!(
                            "tracer {}: stop requested, draining {} queued bytes",
                            self.tracer_id(),
                            queued
                        );
                        drain = Some(queued);
                    }
                    Err(e) => return self.connection_ended(e),
                }
            }
            if drain == Some(0) {
                self.summary.end = EndReason::Cancelled;
                return;
            }

            match stream.wait_readable(&self.session.termination) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("tracer {} drained after stop request", self.tracer_id());
                    self.summary.end = EndReason::Cancelled;
                    return;
                }
                Err(e) => return self.connection_ended(e),
            }

            let frame = match FileLike::Socket(&mut *stream).read_frame(max_packet_size) {
                Ok(frame) => frame,
                Err(e) => return self.connection_ended(e),
            };
            if let Some(remaining) = drain.as_mut() {
                *remaining = remaining.saturating_sub(FRAME_PREFIX_SIZE + frame.len());
            }

            if let Flow::Stop = self.handle_frame(&frame) {
                self.summary.end = EndReason::TerminateMarker;
                return;
            }
        }
    }

    fn connection_ended(&mut self, e: CaptureError) {
        match e {
            CaptureError::NetworkTermination => {
                if self.session.termination.is_requested() {
                    debug!("tracer {} closed its connection while stopping", self.tracer_id());
                    self.summary.end = EndReason::Cancelled;
                } else {
                    debug!("tracer {} closed its connection", self.tracer_id());
                    self.summary.end = EndReason::ConnectionClosed;
                }
            }
            CaptureError::FrameTooLarge { len, max } => {
                error!(
                    "tracer {} sent a {} byte packet, over the {} byte max_packet_size limit; \
                     raise max_packet_size if the tracer really produces packets this large",
                    self.tracer_id(),
                    len,
                    max
                );
                self.summary.end = EndReason::NetworkError;
            }
            e => {
                error!("tracer {}: {}", self.tracer_id(), e);
                self.summary.end = EndReason::NetworkError;
            }
        }
    }

    fn handle_frame(&mut self, frame: &[u8]) -> Flow {
        if frame.is_empty() {
            warn!("tracer {} sent an empty packet", self.tracer_id());
            self.summary.dropped += 1;
            return Flow::Continue;
        }

        let header = match TracePacketHeader::decode(frame) {
            Ok(header) if header.size == frame.len() as u64 => header,
            Ok(header) => {
                warn!(
                    "packet {} declares {} bytes but {} were received, skipping",
                    header.global_packet_index,
                    header.size,
                    frame.len()
                );
                self.summary.dropped += 1;
                return Flow::Continue;
            }
            Err(e) => {
                warn!("skipping undecodable packet: {}", e);
                self.summary.dropped += 1;
                return Flow::Continue;
            }
        };

        if header.body_offset == 0 && header.body_len() > 0 {
            warn!(
                "packet {} has a {} byte body but no body offset",
                header.global_packet_index,
                header.body_len()
            );
        }

        let last = self.session.packet_index.last();
        if !self.session.packet_index.observe(header.global_packet_index) {
            warn!(
                "packet index {} does not follow {}, dropping it",
                header.global_packet_index,
                last.unwrap_or_default()
            );
            self.summary.dropped += 1;
            return Flow::Continue;
        }

        match header.packet_id {
            PacketKind::MARKER_TERMINATE_PROCESS => {
                debug!("tracer {} is terminating", self.tracer_id());
                return Flow::Stop;
            }
            PacketKind::MESSAGE => {
                self.summary.messages += 1;
                self.echo_message(&frame[PACKET_HEADER_SIZE..]);
            }
            _ => {}
        }

        self.persist(header.packet_id, frame);
        Flow::Continue
    }

    fn echo_message(&self, body: &[u8]) {
        let config = &self.session.config;
        if !config.print_trace_messages {
            return;
        }
        match MessageBody::decode(body) {
            Ok(message) if config.verbosity.shows_message(message.level) => {
                println!("{}", message.message);
            }
            Ok(_) => {}
            Err(e) => warn!("unreadable message packet: {}", e),
        }
    }

    fn persist(&mut self, kind: PacketKind, frame: &[u8]) {
        match self.session.trace_file.append(frame) {
            Ok(offset) => {
                self.summary.packets_written += 1;
                if self.session.config.portability_kinds.contains(&kind) {
                    self.portability.push(offset);
                }
            }
            Err(e) => {
                error!("{}", e);
                self.summary.write_failures += 1;
            }
        }
    }

    fn finalize(&mut self) {
        let trace_file = &self.session.trace_file;
        if !trace_file.is_open() {
            return;
        }

        let index = self.session.packet_index.next();
        let packet = self
            .portability
            .to_packet(index, self.tracer_id(), monotonic_ns());
        if let Err(e) = trace_file.append(&packet.encode()) {
            warn!("portability table not written, trace stays unportable: {}", e);
            self.summary.write_failures += 1;
            return;
        }
        self.summary.portability_entries = self.portability.len();

        match trace_file.mark_portability_valid() {
            Ok(()) => self.summary.portability_valid = true,
            Err(e) => warn!("{}", e),
        }
        debug!(
            "tracer {}: {} portability entries",
            self.tracer_id(),
            self.portability.len()
        );
    }
}
