//! Drives one capture session from launch to the finished trace file.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::environment::LaunchEnvironment;
use crate::error::CaptureError;
use crate::injector::Injector;
use crate::recorder::{spawn_recording_thread, RecordingSummary};
use crate::session::{ProcessSession, SessionEvent, SessionState};
use crate::trace::constants::{TRACER_ID_RESERVED, TRACER_ID_VULKAN};
use crate::trace::header::TraceFileHeader;
use crate::trace::portability::PortabilityTable;
use crate::traced_command::{spawn_suspended, LaunchRequest};
use crate::transport::MessageListener;
use crate::utils::{monotonic_ns, realtime_ns};
use crate::watchdog;

/// How long a target gets to exit after SIGINT before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(5);
const STOP_POLL: Duration = Duration::from_millis(10);

/// Tracers the host listens for.
pub const CAPTURED_TRACERS: &[u8] = &[TRACER_ID_VULKAN];

#[derive(Debug, Serialize)]
pub struct SessionReport {
    /// Exit code of the target, `None` if it could not be determined.
    pub exit_code: Option<i32>,
    pub summaries: Vec<RecordingSummary>,
    pub output: PathBuf,
    /// True when no tracer connected and a trace without packets was written.
    pub empty_trace: bool,
}

/// Stops a running session from another thread (for example a Ctrl-C
/// handler).
#[derive(Clone)]
pub struct StopHandle {
    state: Arc<SessionState>,
    events: Sender<SessionEvent>,
    pid: Arc<AtomicU32>,
}

impl StopHandle {
    /// Requests termination and forwards SIGINT to the target. Returns false
    /// if the session was already stopping.
    pub fn stop(&self) -> bool {
        if !self.state.termination.request() {
            return false;
        }
        let pid = self.pid.load(Ordering::Acquire);
        if pid != 0 {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                debug!("failed to send SIGINT to target (PID {}): {}", pid, e);
            }
        }
        if self.events.send(SessionEvent::Stopped).is_err() {
            debug!("stop requested after the session finished");
        }
        true
    }
}

pub struct Orchestrator {
    session: ProcessSession,
    injector: Box<dyn Injector>,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
    pid: Arc<AtomicU32>,
}

impl Orchestrator {
    pub fn new(config: Config, injector: Box<dyn Injector>) -> Self {
        let (events_tx, events_rx) = channel();
        Orchestrator {
            session: ProcessSession::new(config, CAPTURED_TRACERS),
            injector,
            events_tx,
            events_rx,
            pid: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            state: self.session.state.clone(),
            events: self.events_tx.clone(),
            pid: self.pid.clone(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.session.state.config
    }

    pub fn run(mut self) -> Result<SessionReport> {
        let state = self.session.state.clone();
        let config = &state.config;

        let mut environment = LaunchEnvironment::from_process(config);
        for (var, value) in self.injector.environment(&|var| std::env::var(var).ok()) {
            environment.set(&var, value);
        }
        for (var, value) in environment.iter() {
            debug!("target environment: {}={}", var, value);
        }

        for info in &mut self.session.capture_threads {
            let port = info.port();
            let listener = MessageListener::bind(&config.bind_address, port).with_context(|| {
                format!(
                    "Failed to listen for tracer {} on {}:{}",
                    info.tracer_id, config.bind_address, port
                )
            })?;
            info.listener = Some(listener);
        }

        let request = LaunchRequest {
            program: config.program.clone(),
            arguments: config.arguments.clone(),
            working_dir: config.working_dir.clone(),
            envp: environment.to_envp(std::env::vars_os()),
        };
        let target = spawn_suspended(&request)
            .with_context(|| format!("Failed to launch '{}'", config.program))?;
        self.pid.store(target.pid, Ordering::Release);

        if let Err(e) = self.injector.inject(&target) {
            // Dropping the target kills and reaps it.
            drop(target);
            self.pid.store(0, Ordering::Release);
            return Err(e).with_context(|| format!("{} injection failed", self.injector.name()));
        }
        let pid = target.pid;
        self.session.process = Some(target);

        let started = self
            .session
            .capture_threads
            .iter_mut()
            .try_for_each(spawn_recording_thread);
        if let Err(e) = started {
            self.abort_recording();
            return Err(e).context("Failed to start recording thread");
        }

        let resumed = match self.session.process.as_mut() {
            Some(process) => process.resume(),
            None => Err(CaptureError::SpawnFailure("target process went away".to_string())),
        };
        if let Err(e) = resumed {
            self.abort_recording();
            return Err(e).with_context(|| format!("Failed to launch '{}'", config.program));
        }
        eprintln!("Tracing {} (PID {})...", config.program, pid);

        if let Some(process) = self.session.process.as_ref() {
            let handle = watchdog::spawn(process, state.clone(), self.events_tx.clone())
                .context("Failed to start watchdog thread")?;
            self.session.watchdog = Some(handle);
        }

        match self.events_rx.recv() {
            Ok(SessionEvent::TargetExited(code)) => info!("target exited with code {}", code),
            Ok(SessionEvent::Stopped) => info!("capture stopped by request"),
            Err(_) => warn!("session event channel closed"),
        }
        // Both event sources request termination first; this covers the
        // closed-channel case.
        state.termination.request();

        // The target must be gone before the recorders are joined, so a
        // target that ignores SIGINT still ends the session.
        let exit_code = self.stop_target();
        let (summaries, fatal) = self.join_recording_threads();

        let empty_trace = fatal.is_none() && !state.trace_file.is_open();
        if empty_trace {
            write_empty_trace(&state).context("Failed to write empty trace")?;
        }
        state.trace_file.close().with_context(|| {
            format!("Failed to close {}", state.trace_file.path().display())
        })?;

        if let Some(e) = fatal {
            return Err(e).context("Capture failed");
        }

        for summary in &summaries {
            info!(
                "tracer {}: {} packets, {} messages, {} dropped, {} write failures, {} portability entries ({:?})",
                summary.tracer_id,
                summary.packets_written,
                summary.messages,
                summary.dropped,
                summary.write_failures,
                summary.portability_entries,
                summary.end
            );
        }

        Ok(SessionReport {
            exit_code,
            summaries,
            output: state.trace_file.path().to_path_buf(),
            empty_trace,
        })
    }

    /// Stops recording threads that were started for a session that never ran.
    fn abort_recording(&mut self) {
        self.session.state.termination.request();
        let _ = self.join_recording_threads();
    }

    fn join_recording_threads(&mut self) -> (Vec<RecordingSummary>, Option<anyhow::Error>) {
        let mut summaries = Vec::new();
        let mut fatal = None;
        for info in &mut self.session.capture_threads {
            let Some(handle) = info.recording_thread.take() else {
                continue;
            };
            match handle.join() {
                Ok(Ok(summary)) => summaries.push(summary),
                Ok(Err(e)) => {
                    error!("recording thread for tracer {} failed: {}", info.tracer_id, e);
                    fatal.get_or_insert_with(|| anyhow::Error::new(e));
                }
                Err(_) => {
                    error!("recording thread for tracer {} panicked", info.tracer_id);
                    fatal.get_or_insert_with(|| {
                        anyhow!("recording thread for tracer {} panicked", info.tracer_id)
                    });
                }
            }
        }
        (summaries, fatal)
    }

    /// Makes sure the target is gone, then joins the watchdog.
    fn stop_target(&mut self) -> Option<i32> {
        let process = self.session.process.as_ref()?;
        let exit_status = process.exit_status.clone();

        if process.is_alive() {
            process.interrupt();
            eprintln!("Sent SIGINT to traced command (PID {})", process.pid);
            let deadline = Instant::now() + STOP_GRACE;
            while process.is_alive() && Instant::now() < deadline {
                thread::sleep(STOP_POLL);
            }
        }

        let mut killed = false;
        if process.is_alive() {
            warn!("target (PID {}) ignored SIGINT, killing it", process.pid);
            killed = true;
        }
        // Kills and reaps the target if nothing else did.
        self.session.process = None;
        self.pid.store(0, Ordering::Release);

        if let Some(handle) = self.session.watchdog.take() {
            if handle.join().is_err() {
                warn!("watchdog thread panicked");
            }
        }

        let code = *exit_status.lock().unwrap_or_else(|e| e.into_inner());
        if killed {
            code.or(Some(128 + libc::SIGKILL))
        } else {
            code
        }
    }
}

/// Writes a trace for a session where no tracer ever sent a header: a host
/// header with no tracers followed by an empty portability table.
fn write_empty_trace(state: &SessionState) -> Result<(), CaptureError> {
    let header = TraceFileHeader::new(Vec::new(), 0, realtime_ns());
    state.trace_file.create(&header, &[])?;
    let index = state.packet_index.next();
    let packet = PortabilityTable::new().to_packet(index, TRACER_ID_RESERVED, monotonic_ns());
    state.trace_file.append(&packet.encode())?;
    state.trace_file.mark_portability_valid()?;
    info!(
        "no tracer connected, wrote empty trace {}",
        state.trace_file.path().display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injector::{LayerInjector, PreloadInjector};
    use crate::trace::reader::TraceReader;
    use std::fs::File;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir, program: &str) -> Config {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        Config {
            program: program.to_string(),
            output: dir.path().join("out.vktrace"),
            base_port: port.saturating_sub(TRACER_ID_VULKAN as u16),
            ..Default::default()
        }
    }

    #[test]
    fn test_target_without_tracer_gives_empty_trace() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir, "true");
        let report = Orchestrator::new(config, Box::new(LayerInjector)).run().unwrap();

        assert_eq!(report.exit_code, Some(0));
        assert!(report.empty_trace);
        assert_eq!(report.summaries.len(), 1);
        assert!(!report.summaries[0].received_header());

        let mut reader = TraceReader::open(File::open(&report.output).unwrap()).unwrap();
        assert!(reader.header.tracers.is_empty());
        assert!(reader.header.portability_table_valid);
        assert!(reader.portability.as_ref().unwrap().is_empty());
        assert!(reader.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_exit_code_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir, "sh");
        config.arguments = vec!["-c".to_string(), "exit 4".to_string()];
        let report = Orchestrator::new(config, Box::new(LayerInjector)).run().unwrap();
        assert_eq!(report.exit_code, Some(4));
    }

    #[test]
    fn test_spawn_failure_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir, "/nonexistent/vkcube");
        let output = config.output.clone();
        let err = Orchestrator::new(config, Box::new(LayerInjector)).run().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CaptureError>(),
            Some(CaptureError::SpawnFailure(_))
        ));
        assert!(!output.exists());
    }

    #[test]
    fn test_injection_failure_aborts() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir, "true");
        let output = config.output.clone();
        let injector = PreloadInjector::new(dir.path().join("missing.so"));
        let err = Orchestrator::new(config, Box::new(injector)).run().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CaptureError>(),
            Some(CaptureError::InjectionFailure { .. })
        ));
        assert!(!output.exists());
    }

    #[test]
    fn test_stop_handle_interrupts_target() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir, "sleep");
        config.arguments = vec!["30".to_string()];
        let orchestrator = Orchestrator::new(config, Box::new(LayerInjector));
        let stop = orchestrator.stop_handle();

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            stop.stop()
        });
        let report = orchestrator.run().unwrap();
        assert!(stopper.join().unwrap());
        assert_eq!(report.exit_code, Some(128 + libc::SIGINT));
        assert!(report.empty_trace);
    }

    #[test]
    fn test_stop_handle_tolerates_vanished_target() {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(config_in(&dir, "true"), Box::new(LayerInjector));
        let mut child = std::process::Command::new("true").spawn().unwrap();
        child.wait().unwrap();
        orchestrator.pid.store(child.id(), Ordering::Release);

        let stop = orchestrator.stop_handle();
        // Nobody is left to receive the event.
        drop(orchestrator);
        assert!(stop.stop());
        assert!(!stop.stop());
        assert!(stop.state.termination.is_requested());
    }
}
