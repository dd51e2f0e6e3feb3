//! Background thread that waits for the target to exit.
//!
//! The watchdog is the only place that blocks in `waitpid` for a running
//! target. It never touches the trace file; it only records the exit code and
//! asks the session to stop.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::session::{SessionEvent, SessionState};
use crate::traced_command::TargetProcess;

/// Starts watching `target`.
///
/// The thread returns true if it was the one that requested termination. If
/// the session was already stopping it exits without posting anything.
pub fn spawn(
    target: &TargetProcess,
    session: Arc<SessionState>,
    events: Sender<SessionEvent>,
) -> io::Result<JoinHandle<bool>> {
    let pid = target.pid;
    let waited = target.waited.clone();
    let exit_status = target.exit_status.clone();

    thread::Builder::new()
        .name("vktrace-watchdog".to_string())
        .spawn(move || {
            let code = wait_for_exit(pid, &waited, &exit_status);
            match code {
                Some(code) => info!("target process {} exited with {}", pid, code),
                None => debug!("target process {} was reaped elsewhere", pid),
            }

            if !session.termination.request() {
                debug!("session already stopping, watchdog exits quietly");
                return false;
            }
            let _ = events.send(SessionEvent::TargetExited(code.unwrap_or(0)));
            true
        })
}

fn wait_for_exit(pid: u32, waited: &AtomicBool, exit_status: &Mutex<Option<i32>>) -> Option<i32> {
    loop {
        match waitpid(Pid::from_raw(pid as i32), None) {
            Ok(WaitStatus::Exited(_, code)) => return Some(record(code, waited, exit_status)),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return Some(record(128 + signal as i32, waited, exit_status))
            }
            Ok(status) => debug!("ignoring wait status {:?}", status),
            Err(nix::errno::Errno::EINTR) => {}
            Err(e) => {
                if e != nix::errno::Errno::ECHILD {
                    warn!("waitpid({}) failed: {}", pid, e);
                }
                return *exit_status.lock().unwrap_or_else(|e| e.into_inner());
            }
        }
    }
}

fn record(code: i32, waited: &AtomicBool, exit_status: &Mutex<Option<i32>>) -> i32 {
    *exit_status.lock().unwrap_or_else(|e| e.into_inner()) = Some(code);
    // Set waited after exit_status so Acquire readers see both
    waited.store(true, Ordering::Release);
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::traced_command::{spawn_suspended, LaunchRequest};
    use std::sync::mpsc::channel;

    fn start(script: &str) -> TargetProcess {
        let mut target = spawn_suspended(&LaunchRequest {
            program: "sh".to_string(),
            arguments: vec!["-c".to_string(), script.to_string()],
            ..Default::default()
        })
        .unwrap();
        target.resume().unwrap();
        target
    }

    #[test]
    fn test_reports_exit_code() {
        let session = Arc::new(SessionState::new(Config::default()));
        let (tx, rx) = channel();
        let target = start("exit 3");
        let handle = spawn(&target, session.clone(), tx).unwrap();

        assert_eq!(rx.recv().unwrap(), SessionEvent::TargetExited(3));
        assert!(handle.join().unwrap());
        assert!(session.termination.is_requested());
        assert!(target.waited.load(Ordering::Acquire));
        assert_eq!(target.exit_code(), Some(3));
    }

    #[test]
    fn test_quiet_when_already_stopping() {
        let session = Arc::new(SessionState::new(Config::default()));
        session.termination.request();
        let (tx, rx) = channel();
        let target = start("exit 0");
        let handle = spawn(&target, session, tx).unwrap();

        assert!(!handle.join().unwrap());
        assert!(rx.try_recv().is_err());
        assert_eq!(target.exit_code(), Some(0));
    }

    #[test]
    fn test_signals_exactly_once_under_racing_stop() {
        for _ in 0..20 {
            let session = Arc::new(SessionState::new(Config::default()));
            let (tx, rx) = channel();
            let target = start("exit 1");
            let handle = spawn(&target, session.clone(), tx.clone()).unwrap();

            let stopper = {
                let session = session.clone();
                thread::spawn(move || {
                    if session.termination.request() {
                        let _ = tx.send(SessionEvent::Stopped);
                        true
                    } else {
                        false
                    }
                })
            };

            let watchdog_won = handle.join().unwrap();
            let stopper_won = stopper.join().unwrap();
            assert!(watchdog_won ^ stopper_won);
            let events: Vec<_> = rx.try_iter().collect();
            assert_eq!(events.len(), 1);
            assert_eq!(target.exit_code(), Some(1));
        }
    }
}
