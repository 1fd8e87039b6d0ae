//! Console patterns for distribution runs.
//!
//! Plain substrings, matched literally and case-sensitively against a run's
//! accumulated stdout and stderr.

/// Printed once the server has bound its connectors and is serving.
pub const STARTED: &str = "Started @";

/// Printed when the server fails during startup. Seeing one of these while
/// waiting for [`STARTED`] means the wait will not succeed.
pub const STARTUP_FAILURE_PATTERNS: &[&str] = &[
    "FAILED ",                // Component failed to start
    "Address already in use", // Port raced by another process
    "Exception in",           // Uncaught error on a startup thread
    "panicked at",            // Rust payloads
];

/// Return the first failure pattern present in `output`, if any.
pub fn startup_failure(output: &str) -> Option<&'static str> {
    STARTUP_FAILURE_PATTERNS
        .iter()
        .copied()
        .find(|pattern| output.contains(pattern))
}
