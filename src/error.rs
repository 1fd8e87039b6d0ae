//! Error taxonomy for the distribution harness.
//!
//! Only hard failures live here. Timeouts and nonzero exit codes are reported
//! as data (`bool` / `Option<i32>`) by [`crate::run::Run`], never as errors.

use std::io;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum HarnessError {
    /// Missing or invalid build options, or an unusable reference distribution.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("artifact {coordinates} not found (looked at {})", path.display())]
    ArtifactNotFound { coordinates: String, path: PathBuf },

    #[error("io failure at {}: {source}", path.display())]
    IoFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to launch {}: {source}", program.display())]
    LaunchFailure {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no free port available: {0}")]
    ResourceExhausted(#[source] io::Error),

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to decode configuration: {0}")]
    ConfigDecode(#[from] toml::de::Error),

    #[error("failed to encode installation descriptor: {0}")]
    DescriptorEncode(#[from] toml::ser::Error),
}

impl HarnessError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::IoFailure {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;
