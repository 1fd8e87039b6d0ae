//! Harness for testing server distributions end to end.
//!
//! The pieces, leaves first:
//! - [`port::free_port`] - OS-assigned free port
//! - [`DistributionConfig`] - immutable, builder-validated configuration
//! - [`InstallationBuilder`] / [`Installation`] - private base directory over
//!   a shared home, with artifact installation
//! - [`Run`] - one subprocess execution with bounded waits on exit and on
//!   console output
//!
//! Typical flow: build an installation, install artifacts, `start`, await
//! [`patterns::STARTED`], talk to the server on the allocated port, `stop`,
//! then confirm with `await_exit`.

pub mod config;
pub mod error;
pub mod installation;
pub mod logging;
pub mod patterns;
pub mod port;
pub mod run;

// Re-export commonly used items
pub use config::{DistributionConfig, DistributionConfigBuilder};
pub use error::{HarnessError, Result};
pub use installation::artifact::ArtifactCoordinates;
pub use installation::{Installation, InstallationBuilder, InstallationDescriptor};
pub use port::free_port;
pub use run::{Run, RunState};
