//! Environment handed to the target process.
//!
//! The capture host never changes its own environment. It computes the
//! variables the target needs from the current values and passes a complete
//! environment block to `execve`.

use std::collections::BTreeMap;
use std::ffi::OsString;

use crate::config::Config;

pub const TRACER_LAYER: &str = "VK_LAYER_LUNARG_vktrace";
pub const SCREENSHOT_LAYER: &str = "VK_LAYER_LUNARG_screenshot";

pub const INSTANCE_LAYERS_VAR: &str = "VK_INSTANCE_LAYERS";
pub const DEVICE_LAYERS_VAR: &str = "VK_DEVICE_LAYERS";
pub const SCREENSHOT_FRAMES_VAR: &str = "VK_SCREENSHOT_FRAMES";
pub const SCREENSHOT_FORMAT_VAR: &str = "VK_SCREENSHOT_FORMAT";
pub const VERBOSITY_VAR: &str = "_VKTRACE_VERBOSITY";
pub const PMB_ENABLE_VAR: &str = "VKTRACE_PMB_ENABLE";
pub const TRIM_TRIGGER_VAR: &str = "VKTRACE_TRIM_TRIGGER";
pub const PORT_BASE_VAR: &str = "VKTRACE_PORT_BASE";

pub const LAYER_SEPARATOR: char = ':';

/// Puts `layers` at the front of an existing layer list.
///
/// Layers already configured by the user are kept in their order; any
/// occurrence of a prepended layer is removed so it appears once.
pub fn prepend_layers(existing: Option<&str>, layers: &[&str]) -> String {
    let mut out: Vec<&str> = layers.to_vec();
    if let Some(existing) = existing {
        for layer in existing.split(LAYER_SEPARATOR) {
            let layer = layer.trim();
            if layer.is_empty() || out.contains(&layer) {
                continue;
            }
            out.push(layer);
        }
    }
    out.join(&LAYER_SEPARATOR.to_string())
}

/// Variables set or overridden for the target, on top of the inherited ones.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LaunchEnvironment {
    overrides: BTreeMap<String, String>,
}

impl LaunchEnvironment {
    /// Computes the target's overrides. `current` looks up the value the
    /// host currently sees for a variable.
    pub fn for_config<F>(config: &Config, current: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut layers = vec![TRACER_LAYER];
        if config.screenshots_enabled() {
            layers.push(SCREENSHOT_LAYER);
        }

        let mut env = LaunchEnvironment::default();
        for var in [INSTANCE_LAYERS_VAR, DEVICE_LAYERS_VAR] {
            env.set(var, prepend_layers(current(var).as_deref(), &layers));
        }
        if let Some(frames) = &config.screenshot_frames {
            env.set(SCREENSHOT_FRAMES_VAR, frames.clone());
        }
        if let Some(format) = &config.screenshot_format {
            env.set(SCREENSHOT_FORMAT_VAR, format.clone());
        }
        if let Some(trigger) = &config.trim_trigger {
            env.set(TRIM_TRIGGER_VAR, trigger.clone());
        }
        env.set(VERBOSITY_VAR, config.verbosity.as_str().to_string());
        env.set(
            PMB_ENABLE_VAR,
            if config.track_persistent_mappings { "1" } else { "0" }.to_string(),
        );
        env.set(PORT_BASE_VAR, config.base_port.to_string());
        env
    }

    /// Uses the host process environment for lookups.
    pub fn from_process(config: &Config) -> Self {
        Self::for_config(config, |var| std::env::var(var).ok())
    }

    pub fn set(&mut self, var: &str, value: String) {
        self.overrides.insert(var.to_string(), value);
    }

    pub fn get(&self, var: &str) -> Option<&str> {
        self.overrides.get(var).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.overrides.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The full block for `execve`: inherited variables with overrides
    /// applied, as `KEY=VALUE` entries.
    pub fn to_envp<I>(&self, inherited: I) -> Vec<OsString>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let mut merged: BTreeMap<OsString, OsString> = inherited.into_iter().collect();
        for (key, value) in &self.overrides {
            merged.insert(OsString::from(key), OsString::from(value));
        }
        merged
            .into_iter()
            .map(|(key, value)| {
                let mut entry = key;
                entry.push("=");
                entry.push(value);
                entry
            })
            .collect()
    }
}
