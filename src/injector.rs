//! Getting the tracer into the target process.
//!
//! The target is held before `exec`, so an injector has two chances to act:
//! it can add variables to the environment the target starts with, and it can
//! inspect the suspended child before it is released.

use std::fs::File;
use std::path::PathBuf;

use tracing::debug;

use crate::error::CaptureError;
use crate::traced_command::TargetProcess;

pub const PRELOAD_VAR: &str = "LD_PRELOAD";

pub trait Injector: Send {
    /// Short name used in log messages.
    fn name(&self) -> &'static str;

    /// Variables the target must be started with. `current` looks up the
    /// value the host sees for a variable.
    fn environment(&self, current: &dyn Fn(&str) -> Option<String>) -> Vec<(String, String)>;

    /// Runs against the suspended target before it is resumed.
    fn inject(&self, target: &TargetProcess) -> Result<(), CaptureError>;
}

/// Relies on the Vulkan loader to load the tracer layer, which the launch
/// environment already lists.
#[derive(Debug, Default)]
pub struct LayerInjector;

impl Injector for LayerInjector {
    fn name(&self) -> &'static str {
        "layer"
    }

    fn environment(&self, _current: &dyn Fn(&str) -> Option<String>) -> Vec<(String, String)> {
        Vec::new()
    }

    fn inject(&self, target: &TargetProcess) -> Result<(), CaptureError> {
        if !target.is_alive() {
            return Err(CaptureError::InjectionFailure {
                pid: target.pid,
                reason: "process exited before the tracer layer could be enabled".to_string(),
            });
        }
        debug!("tracer layer will be loaded by process {}", target.pid);
        Ok(())
    }
}

/// Loads a tracer library with `LD_PRELOAD`.
#[derive(Debug)]
pub struct PreloadInjector {
    pub library: PathBuf,
}

impl PreloadInjector {
    pub fn new(library: impl Into<PathBuf>) -> Self {
        PreloadInjector {
            library: library.into(),
        }
    }
}

impl Injector for PreloadInjector {
    fn name(&self) -> &'static str {
        "preload"
    }

    fn environment(&self, current: &dyn Fn(&str) -> Option<String>) -> Vec<(String, String)> {
        let library = self.library.display().to_string();
        let value = match current(PRELOAD_VAR) {
            Some(existing) if !existing.trim().is_empty() => {
                if existing.split([':', ' ']).any(|entry| entry == library) {
                    existing
                } else {
                    format!("{library}:{existing}")
                }
            }
            _ => library,
        };
        vec![(PRELOAD_VAR.to_string(), value)]
    }

    fn inject(&self, target: &TargetProcess) -> Result<(), CaptureError> {
        if let Err(e) = File::open(&self.library) {
            return Err(CaptureError::InjectionFailure {
                pid: target.pid,
                reason: format!("cannot read {}: {}", self.library.display(), e),
            });
        }
        if !target.is_alive() {
            return Err(CaptureError::InjectionFailure {
                pid: target.pid,
                reason: "process exited before it could be released".to_string(),
            });
        }
        debug!(
            "process {} will preload {}",
            target.pid,
            self.library.display()
        );
        Ok(())
    }
}
