//! vktrace capture host library.
//!
//! Launches a Vulkan application with the vktrace tracer enabled, accepts the
//! tracer's loopback connection and persists the packets it streams into a
//! trace file that ends in a portability table.
//!
//! # Modules
//!
//! - [`orchestrator`] - runs a whole capture session
//! - [`recorder`] - per-tracer recording thread
//! - [`transport`] - framed TCP loopback transport and handshake
//! - [`trace`] - trace file and packet formats, and a reader for finished traces
//! - [`producer`] - tracer side of the transport
//!
//! # Example
//!
//! ```no_run
//! use vktrace_capture::{Config, LayerInjector, Orchestrator};
//!
//! let config = Config {
//!     program: "vkcube".to_string(),
//!     ..Default::default()
//! };
//! let report = Orchestrator::new(config, Box::new(LayerInjector))
//!     .run()
//!     .expect("capture failed");
//! println!("trace written to {}", report.output.display());
//! ```

pub mod config;
pub mod environment;
pub mod error;
pub mod injector;
pub mod orchestrator;
pub mod producer;
pub mod recorder;
pub mod session;
pub mod trace;
pub mod traced_command;
pub mod transport;
pub mod utils;
pub mod watchdog;

pub use config::{Config, Verbosity};
pub use error::CaptureError;
pub use injector::{Injector, LayerInjector, PreloadInjector};
pub use orchestrator::{Orchestrator, SessionReport, StopHandle};
pub use producer::TraceProducer;
pub use recorder::{EndReason, RecordingSummary};
