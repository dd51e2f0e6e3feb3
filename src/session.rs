//! Per-run session state shared between the orchestrator, the recording
//! threads and the watchdog.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::CaptureError;
use crate::recorder::RecordingSummary;
use crate::trace::constants::tracer_port;
use crate::trace::header::{GpuInfo, TraceFileHeader, PORTABILITY_VALID_OFFSET};
use crate::traced_command::TargetProcess;
use crate::transport::{FileLike, MessageListener};

/// Cooperative stop request, polled at loop boundaries.
///
/// The first party to call [`TerminationFlag::request`] wins; later callers
/// see `false` and must not signal anyone again.
#[derive(Debug, Default)]
pub struct TerminationFlag(AtomicBool);

impl TerminationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Posted to the orchestrator by whoever ended the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// The watchdog reaped the target with this exit code.
    TargetExited(i32),
    /// The operator asked to stop.
    Stopped,
}

/// Tracks `global_packet_index` across every tracer writing into one file.
#[derive(Debug, Default)]
pub struct PacketIndexTracker {
    last: Mutex<Option<u64>>,
}

impl PacketIndexTracker {
    /// Records a received index. Returns false if it does not strictly
    /// increase on the last one; the highest index seen is kept either way.
    pub fn observe(&self, index: u64) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(prev) if index <= prev => false,
            _ => {
                *last = Some(index);
                true
            }
        }
    }

    /// Allocates the next index for a packet generated by the host itself.
    pub fn next(&self) -> u64 {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let next = last.map_or(0, |prev| prev + 1);
        *last = Some(next);
        next
    }

    pub fn last(&self) -> Option<u64> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The output trace file. Every write and the final header patch happen
/// under one lock, so packets from several tracers never interleave.
#[derive(Debug)]
pub struct TraceFile {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl TraceFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TraceFile {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Option<File>> {
        self.file.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Creates the file and writes the header and GPU infos.
    ///
    /// The portability flag is always written as false. Returns `false`
    /// without writing if another tracer already created the file.
    pub fn create(
        &self,
        header: &TraceFileHeader,
        gpu_info: &[GpuInfo],
    ) -> Result<bool, CaptureError> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Ok(false);
        }

        let mut header = header.clone();
        header.portability_table_valid = false;

        let mut file = File::create(&self.path)?;
        {
            let mut out = FileLike::File(&mut file);
            out.write_raw(&header.encode())?;
            for info in gpu_info {
                out.write_raw(&info.encode())?;
            }
            out.flush()?;
        }
        debug!(
            "created {} ({} gpu info records)",
            self.path.display(),
            gpu_info.len()
        );
        *guard = Some(file);
        Ok(true)
    }

    /// Appends raw packet bytes and returns the offset they were written at.
    ///
    /// A failed write is rolled back so later packets still start at a packet
    /// boundary.
    pub fn append(&self, bytes: &[u8]) -> Result<u64, CaptureError> {
        let mut guard = self.lock();
        let file = guard
            .as_mut()
            .ok_or_else(|| CaptureError::InvalidTrace("trace file is not open".to_string()))?;
        let offset = file.stream_position()?;

        let result = {
            let mut out = FileLike::File(&mut *file);
            out.write_raw(bytes).and_then(|_| out.flush())
        };
        match result {
            Ok(()) => Ok(offset),
            Err(CaptureError::Io(source)) => {
                if let Err(e) = file.set_len(offset).and_then(|_| file.seek(SeekFrom::Start(offset))) {
                    warn!("could not roll back partial write at {}: {}", offset, e);
                }
                Err(CaptureError::PacketWriteFailure {
                    offset,
                    expected: bytes.len(),
                    source,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Flips the header's portability flag in place.
    pub fn mark_portability_valid(&self) -> Result<(), CaptureError> {
        let mut guard = self.lock();
        let file = guard
            .as_mut()
            .ok_or_else(|| CaptureError::InvalidTrace("trace file is not open".to_string()))?;
        let patch = |file: &mut File| -> std::io::Result<()> {
            file.seek(SeekFrom::Start(PORTABILITY_VALID_OFFSET))?;
            file.write_all(&[1])?;
            file.flush()?;
            file.seek(SeekFrom::End(0))?;
            Ok(())
        };
        patch(file).map_err(CaptureError::PortabilityFinalizeFailure)
    }

    /// Syncs and closes the file. Further appends fail.
    pub fn close(&self) -> Result<(), CaptureError> {
        if let Some(file) = self.lock().take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

/// State every thread of a session can see.
#[derive(Debug)]
pub struct SessionState {
    pub config: Config,
    pub termination: TerminationFlag,
    pub trace_file: TraceFile,
    pub packet_index: PacketIndexTracker,
}

impl SessionState {
    pub fn new(config: Config) -> Self {
        let trace_file = TraceFile::new(&config.output);
        SessionState {
            config,
            termination: TerminationFlag::new(),
            trace_file,
            packet_index: PacketIndexTracker::default(),
        }
    }
}

pub type RecordingHandle = JoinHandle<Result<RecordingSummary, CaptureError>>;

/// One tracer's listener and recording thread.
pub struct CaptureThreadInfo {
    pub tracer_id: u8,
    pub listener: Option<MessageListener>,
    pub recording_thread: Option<RecordingHandle>,
    pub session: Arc<SessionState>,
}

impl CaptureThreadInfo {
    pub fn new(tracer_id: u8, session: Arc<SessionState>) -> Self {
        CaptureThreadInfo {
            tracer_id,
            listener: None,
            recording_thread: None,
            session,
        }
    }

    pub fn port(&self) -> u16 {
        tracer_port(self.session.config.base_port, self.tracer_id)
    }
}

/// Everything owned by one trace run.
pub struct ProcessSession {
    pub state: Arc<SessionState>,
    pub capture_threads: Vec<CaptureThreadInfo>,
    pub process: Option<TargetProcess>,
    pub watchdog: Option<JoinHandle<bool>>,
}

impl ProcessSession {
    pub fn new(config: Config, tracer_ids: &[u8]) -> Self {
        let state = Arc::new(SessionState::new(config));
        let capture_threads = tracer_ids
            .iter()
            .map(|id| CaptureThreadInfo::new(*id, state.clone()))
            .collect();
        ProcessSession {
            state,
            capture_threads,
            process: None,
            watchdog: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::header::TracerInfo;
    use crate::trace::reader::TraceReader;
    use std::io::Read;

    #[test]
    fn test_termination_flag_has_one_winner() {
        let flag = Arc::new(TerminationFlag::new());
        let winners: usize = (0..8)
            .map(|_| {
                let flag = flag.clone();
                std::thread::spawn(move || flag.request())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
        assert!(flag.is_requested());
    }

    #[test]
    fn test_packet_index_tracker() {
        let tracker = PacketIndexTracker::default();
        assert!(tracker.observe(0));
        assert!(tracker.observe(5));
        assert!(!tracker.observe(5));
        assert!(!tracker.observe(3));
        assert_eq!(tracker.last(), Some(5));
        assert_eq!(tracker.next(), 6);
        assert_eq!(PacketIndexTracker::default().next(), 0);
    }

    #[test]
    fn test_trace_file_append_and_patch() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.vktrace");
        let trace = TraceFile::new(&path);
        assert!(!trace.is_open());
        assert!(trace.append(b"x").is_err());

        let mut header = TraceFileHeader::new(
            vec![TracerInfo {
                id: 2,
                is_64_bit: true,
            }],
            0,
            1,
        );
        header.portability_table_valid = true;
        assert!(trace.create(&header, &[]).unwrap());
        assert!(!trace.create(&header, &[]).unwrap());

        assert_eq!(trace.append(&[0xEE; 10]).unwrap(), 80);
        assert_eq!(trace.append(&[0xDD; 4]).unwrap(), 90);
        trace.mark_portability_valid().unwrap();
        assert_eq!(trace.append(&[0xCC; 2]).unwrap(), 94);
        trace.close().unwrap();

        let mut bytes = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 96);
        assert_eq!(bytes[PORTABILITY_VALID_OFFSET as usize], 1);
        assert_eq!(&bytes[90..94], &[0xDD; 4]);
    }

    #[test]
    fn test_created_header_starts_invalid() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("flag.vktrace");
        let trace = TraceFile::new(&path);
        let mut header = TraceFileHeader::new(Vec::new(), 0, 0);
        header.portability_table_valid = true;
        trace.create(&header, &[]).unwrap();
        trace.close().unwrap();

        let reader = TraceReader::open(File::open(&path).unwrap()).unwrap();
        assert!(!reader.header.portability_table_valid);
    }
}
