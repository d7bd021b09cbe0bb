//! Keel Telemetry - Logging setup for the Keel component runtime.
//!
//! The runtime crates only emit `tracing` events; this crate installs the
//! subscriber that renders them.
//!
//! # Example
//!
//! ```rust,no_run
//! use keel_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), keel_telemetry::TelemetryError> {
//! let config = LogConfig::new("info")
//!     .with_format(LogFormat::Json)
//!     .with_directive("keel_runtime=debug");
//!
//! setup_logging(&config)?;
//! tracing::info!("runtime starting");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{LogConfig, LogFormat, LogTarget, setup_default_logging, setup_logging};
