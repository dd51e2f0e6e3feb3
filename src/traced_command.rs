//! Fork-pipe-exec launcher for the traced application.
//!
//! [`spawn_suspended`] forks a child that waits for a readiness byte before it
//! changes directory, renames itself and calls `execve`. This gives the host
//! time to inject the tracer and start listening before the application runs.

use std::ffi::{CString, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::error::CaptureError;

/// Name the child gives itself between fork and exec.
pub const CHILD_PROCESS_NAME: &str = "vktrace_target";

/// Longest name the kernel keeps for a task (excluding the NUL).
const MAX_PROCESS_NAME: usize = 15;

/// What to launch and how.
#[derive(Clone, Debug, Default)]
pub struct LaunchRequest {
    pub program: String,
    pub arguments: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Complete `KEY=VALUE` environment for the target
    pub envp: Vec<OsString>,
}

/// A child process that has been forked but is waiting to exec.
///
/// The child blocks on a pipe until [`resume`](TargetProcess::resume) is
/// called. A second pipe with `O_CLOEXEC` on the write end tells the parent
/// whether exec succeeded: EOF means success, four bytes of errno mean failure.
///
/// On drop, if the child has not been reaped, it is killed with `SIGKILL` and
/// reaped.
pub struct TargetProcess {
    pub pid: u32,
    ready_write_fd: Option<i32>,
    exec_read_fd: Option<i32>,
    /// Whether waitpid has already been called for this child. Shared with
    /// the watchdog; whoever wins the compare-exchange reaps the child.
    pub waited: Arc<AtomicBool>,
    /// The child's exit status, set by whoever reaped it.
    pub exit_status: Arc<Mutex<Option<i32>>>,
}

impl Drop for TargetProcess {
    fn drop(&mut self) {
        if let Some(fd) = self.ready_write_fd.take() {
            unsafe { libc::close(fd) };
        }
        if let Some(fd) = self.exec_read_fd.take() {
            unsafe { libc::close(fd) };
        }

        if self
            .waited
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!("killing unreaped target process {}", self.pid);
            unsafe {
                libc::kill(self.pid as i32, libc::SIGKILL);
                let mut status: i32 = 0;
                libc::waitpid(self.pid as i32, &mut status, 0);
            }
        }
    }
}

impl TargetProcess {
    /// Lets the child exec and waits until exec has happened.
    pub fn resume(&mut self) -> Result<(), CaptureError> {
        self.signal_exec()?;
        self.wait_for_exec()
    }

    fn signal_exec(&mut self) -> Result<(), CaptureError> {
        if let Some(fd) = self.ready_write_fd.take() {
            let buf: [u8; 1] = [1];
            let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, 1) };
            // Capture errno before close() can clobber it
            let write_err = if ret < 0 {
                Some(std::io::Error::last_os_error())
            } else {
                None
            };
            unsafe { libc::close(fd) };
            if let Some(err) = write_err {
                return Err(CaptureError::SpawnFailure(format!(
                    "could not release process {}: {}",
                    self.pid, err
                )));
            }
        }
        Ok(())
    }

    fn wait_for_exec(&mut self) -> Result<(), CaptureError> {
        if let Some(fd) = self.exec_read_fd.take() {
            let mut buf = [0u8; 4];
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 4) };
            let read_err = if n < 0 {
                Some(std::io::Error::last_os_error())
            } else {
                None
            };
            unsafe { libc::close(fd) };

            if let Some(err) = read_err {
                return Err(CaptureError::SpawnFailure(format!(
                    "could not read exec status of process {}: {}",
                    self.pid, err
                )));
            }
            if n > 0 {
                let errno = if n >= 4 {
                    i32::from_ne_bytes(buf)
                } else {
                    buf[0] as i32
                };
                self.reap_blocking();
                return Err(CaptureError::SpawnFailure(format!(
                    "failed to exec target: {}",
                    std::io::Error::from_raw_os_error(errno)
                )));
            }
        }
        Ok(())
    }

    fn reap_blocking(&self) {
        if self
            .waited
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let mut status: i32 = 0;
            unsafe { libc::waitpid(self.pid as i32, &mut status, 0) };
            *self.exit_status.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(exit_code_from_status(status));
        }
    }

    /// True while the process exists (including as a zombie).
    pub fn is_alive(&self) -> bool {
        !self.waited.load(Ordering::Acquire) && unsafe { libc::kill(self.pid as i32, 0) } == 0
    }

    /// Sends SIGINT so the application can shut down cleanly.
    pub fn interrupt(&self) {
        if !self.waited.load(Ordering::Acquire)
            && unsafe { libc::kill(self.pid as i32, libc::SIGINT) } != 0
        {
            debug!(
                "failed to send SIGINT to PID {}: {}",
                self.pid,
                std::io::Error::last_os_error()
            );
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Exit code of a `waitpid` status; `128 + signal` for signalled processes.
pub fn exit_code_from_status(status: i32) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        1
    }
}

/// Resolve a command name to its full path by searching PATH.
fn resolve_executable(name: &str) -> Result<PathBuf, CaptureError> {
    use std::os::unix::fs::PermissionsExt;

    let path = Path::new(name);

    if name.contains('/') {
        let metadata = std::fs::metadata(path)
            .map_err(|e| CaptureError::SpawnFailure(format!("cannot access '{name}': {e}")))?;
        if !metadata.is_file() {
            return Err(CaptureError::SpawnFailure(format!(
                "'{name}' is not a regular file"
            )));
        }
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(CaptureError::SpawnFailure(format!("'{name}' is not executable")));
        }
        return Ok(path.to_path_buf());
    }

    if let Ok(path_var) = std::env::var("PATH") {
        for dir in path_var.split(':') {
            let candidate = Path::new(dir).join(name);
            if let Ok(metadata) = std::fs::metadata(&candidate) {
                if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
                    return Ok(candidate);
                }
            }
        }
    }

    Err(CaptureError::SpawnFailure(format!(
        "'{name}' not found in PATH. Specify the full path to the executable."
    )))
}

/// The child's process name, cut to what the kernel keeps.
fn process_name(name: &str) -> CString {
    let bytes: Vec<u8> = name
        .bytes()
        .filter(|b| *b != 0)
        .take(MAX_PROCESS_NAME)
        .collect();
    CString::new(bytes).unwrap_or_default()
}

/// Sends errno to the parent through the exec pipe and exits the child.
///
/// # Safety
///
/// Only for the forked child; uses async-signal-safe calls only.
unsafe fn report_errno_and_exit(fd: i32) -> ! {
    let errno = *libc::__errno_location();
    let errno_bytes = errno.to_ne_bytes();
    libc::write(fd, errno_bytes.as_ptr() as *const libc::c_void, 4);
    libc::close(fd);
    libc::_exit(127);
}

fn to_cstring(bytes: Vec<u8>, what: &str) -> Result<CString, CaptureError> {
    CString::new(bytes)
        .map_err(|_| CaptureError::SpawnFailure(format!("{what} contains a NUL byte")))
}

/// Fork a child that waits to exec `request`.
///
/// The child changes into the working directory only after it has been
/// released, so a bad directory shows up as an exec failure from
/// [`TargetProcess::resume`].
///
/// # Safety
///
/// This calls `libc::fork()`. The child path uses only async-signal-safe
/// functions and never returns: it always calls `_exit()` or `execve()`.
pub fn spawn_suspended(request: &LaunchRequest) -> Result<TargetProcess, CaptureError> {
    if request.program.is_empty() {
        return Err(CaptureError::SpawnFailure("no program specified".to_string()));
    }

    // Everything the child needs is allocated before fork.
    let resolved_path = resolve_executable(&request.program)?;
    debug!(
        "resolved {} -> {}",
        request.program,
        resolved_path.display()
    );

    let path_cstr = to_cstring(resolved_path.as_os_str().as_bytes().to_vec(), "program path")?;
    let mut arg_cstrings = vec![to_cstring(request.program.as_bytes().to_vec(), "program")?];
    for arg in &request.arguments {
        arg_cstrings.push(to_cstring(arg.as_bytes().to_vec(), "argument")?);
    }
    let env_cstrings = request
        .envp
        .iter()
        .map(|entry| to_cstring(entry.clone().into_vec(), "environment entry"))
        .collect::<Result<Vec<_>, _>>()?;
    let cwd_cstr = request
        .working_dir
        .as_ref()
        .map(|dir| to_cstring(dir.as_os_str().as_bytes().to_vec(), "working directory"))
        .transpose()?;
    let name_cstr = process_name(CHILD_PROCESS_NAME);

    let mut argv: Vec<*const libc::c_char> = arg_cstrings.iter().map(|s| s.as_ptr()).collect();
    argv.push(std::ptr::null());
    let mut envp: Vec<*const libc::c_char> = env_cstrings.iter().map(|s| s.as_ptr()).collect();
    envp.push(std::ptr::null());

    let mut ready_fds = [0i32; 2];
    if unsafe { libc::pipe(ready_fds.as_mut_ptr()) } != 0 {
        return Err(CaptureError::SpawnFailure(format!(
            "failed to create ready pipe: {}",
            std::io::Error::last_os_error()
        )));
    }
    let ready_read = ready_fds[0];
    let ready_write = ready_fds[1];

    let mut exec_fds = [0i32; 2];
    if unsafe { libc::pipe2(exec_fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        unsafe {
            libc::close(ready_read);
            libc::close(ready_write);
        }
        return Err(CaptureError::SpawnFailure(format!(
            "failed to create exec pipe: {}",
            std::io::Error::last_os_error()
        )));
    }
    let exec_read = exec_fds[0];
    let exec_write = exec_fds[1];

    let parent_pid = unsafe { libc::getpid() };

    let pid = unsafe { libc::fork() };
    match pid {
        -1 => {
            unsafe {
                libc::close(ready_read);
                libc::close(ready_write);
                libc::close(exec_read);
                libc::close(exec_write);
            }
            Err(CaptureError::SpawnFailure(format!(
                "fork() failed: {}",
                std::io::Error::last_os_error()
            )))
        }
        0 => {
            // Child: async-signal-safe calls only, never return.
            unsafe {
                libc::close(ready_write);
                libc::close(exec_read);

                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
                if libc::getppid() != parent_pid {
                    libc::_exit(1);
                }

                let mut buf = [0u8; 1];
                let n = libc::read(ready_read, buf.as_mut_ptr() as *mut libc::c_void, 1);
                libc::close(ready_read);
                if n <= 0 {
                    libc::_exit(1);
                }

                if let Some(cwd) = &cwd_cstr {
                    if libc::chdir(cwd.as_ptr()) != 0 {
                        report_errno_and_exit(exec_write);
                    }
                }
                libc::prctl(libc::PR_SET_NAME, name_cstr.as_ptr() as libc::c_ulong, 0, 0, 0);

                libc::execve(path_cstr.as_ptr(), argv.as_ptr(), envp.as_ptr());
                report_errno_and_exit(exec_write);
            }
        }
        child_pid => {
            unsafe {
                libc::close(ready_read);
                libc::close(exec_write);
            }
            info!("started {} as process {} (held before exec)", request.program, child_pid);

            Ok(TargetProcess {
                pid: child_pid as u32,
                ready_write_fd: Some(ready_write),
                exec_read_fd: Some(exec_read),
                waited: Arc::new(AtomicBool::new(false)),
                exit_status: Arc::new(Mutex::new(None)),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inherited_envp() -> Vec<OsString> {
        std::env::vars_os()
            .map(|(k, v)| {
                let mut entry = k;
                entry.push("=");
                entry.push(v);
                entry
            })
            .collect()
    }

    fn request(program: &str, args: &[&str]) -> LaunchRequest {
        LaunchRequest {
            program: program.to_string(),
            arguments: args.iter().map(|s| s.to_string()).collect(),
            working_dir: None,
            envp: inherited_envp(),
        }
    }

    fn wait_exit(target: &TargetProcess) -> i32 {
        assert!(target
            .waited
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok());
        let mut status = 0;
        unsafe { libc::waitpid(target.pid as i32, &mut status, 0) };
        exit_code_from_status(status)
    }

    #[test]
    fn test_missing_program_is_spawn_failure() {
        let err = spawn_suspended(&request("definitely-not-a-real-program-xyz", &[]))
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::SpawnFailure(_)));
    }

    #[test]
    fn test_runs_after_resume() {
        let mut target = spawn_suspended(&request("sh", &["-c", "exit 7"])).unwrap();
        assert!(target.is_alive());
        target.resume().unwrap();
        assert_eq!(wait_exit(&target), 7);
    }

    #[test]
    fn test_working_directory_and_environment() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut req = request(
            "sh",
            &["-c", "test \"$VKTRACE_TEST_VAR\" = yes && touch marker"],
        );
        req.working_dir = Some(dir.path().to_path_buf());
        req.envp.push(OsString::from("VKTRACE_TEST_VAR=yes"));

        let mut target = spawn_suspended(&req).unwrap();
        target.resume().unwrap();
        assert_eq!(wait_exit(&target), 0);
        assert!(dir.path().join("marker").exists());
    }

    #[test]
    fn test_bad_working_directory_fails_resume() {
        let mut req = request("true", &[]);
        req.working_dir = Some(PathBuf::from("/nonexistent/vktrace/dir"));
        let mut target = spawn_suspended(&req).unwrap();
        assert!(matches!(target.resume(), Err(CaptureError::SpawnFailure(_))));
        assert_eq!(target.exit_code(), Some(127));
    }

    #[test]
    fn test_process_name_is_truncated() {
        assert_eq!(process_name("vktrace_target").as_bytes(), b"vktrace_target");
        assert_eq!(
            process_name("a_very_long_process_name").as_bytes().len(),
            MAX_PROCESS_NAME
        );
    }

    #[test]
    fn test_exit_code_from_signal() {
        let mut target = spawn_suspended(&request("sh", &["-c", "kill -9 $$"])).unwrap();
        target.resume().unwrap();
        assert_eq!(wait_exit(&target), 128 + libc::SIGKILL);
    }
}
