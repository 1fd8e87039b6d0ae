//! One execution of an installation.
//!
//! A [`Run`] owns a spawned child process, a [`ConsoleWatcher`] draining its
//! stdout and stderr, and a reaper thread that publishes the exit code exactly
//! once. The lifecycle is
//!
//! ```text
//! NotStarted --start--> Running --exit-----------> Exited
//!                               \--stop/kill+exit-> Stopped
//! ```
//!
//! `NotStarted` has no value of its own: a `Run` only exists once the child
//! has spawned. Both end states are terminal; start the installation again
//! for a fresh `Run`.
//!
//! Timeouts and nonzero exit codes are reported as data. Only spawn and
//! signal failures are errors.

pub mod console;

use crate::error::{HarnessError, Result};
use console::ConsoleWatcher;
use std::io::Read;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Bound on the implicit kill-and-reap performed when a live `Run` is dropped.
const DROP_REAP_TIMEOUT: Duration = Duration::from_secs(5);
/// Poll interval for log files, which have no change notification here.
const LOG_FILE_POLL: Duration = Duration::from_millis(100);

/// Observable lifecycle state of a [`Run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    /// Terminated on its own, normally or by crashing.
    Exited(i32),
    /// Terminated after [`Run::stop`] or [`Run::kill`] signalled it.
    ///
    /// A child that dies on its own in the instant between the liveness
    /// check and the signal is still reported here.
    Stopped(i32),
}

/// Exit code written once by the reaper, read by anyone.
#[derive(Default)]
struct ExitSignal {
    code: Mutex<Option<i32>>,
    published: Condvar,
}

impl ExitSignal {
    fn slot(&self) -> MutexGuard<'_, Option<i32>> {
        self.code.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, code: i32) {
        let mut slot = self.slot();
        if slot.is_none() {
            *slot = Some(code);
        }
        self.published.notify_all();
    }

    fn get(&self) -> Option<i32> {
        *self.slot()
    }

    fn wait(&self, timeout: Duration) -> bool {
        let slot = self.slot();
        let (slot, _) = self
            .published
            .wait_timeout_while(slot, timeout, |code| code.is_none())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.is_some()
    }
}

/// A single subprocess execution of an installation.
pub struct Run {
    program: PathBuf,
    args: Vec<String>,
    pid: u32,
    console: ConsoleWatcher,
    exit: Arc<ExitSignal>,
    stop_requested: AtomicBool,
}

impl Run {
    /// Spawn `cmd` and attach the console watcher before returning.
    ///
    /// `cmd` must have stdout and stderr piped for output to be observed.
    pub(crate) fn spawn(mut cmd: Command, program: PathBuf, args: Vec<String>) -> Result<Self> {
        let mut child = cmd.spawn().map_err(|source| HarnessError::LaunchFailure {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();

        let mut streams: Vec<(&'static str, Box<dyn Read + Send>)> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            streams.push(("stdout", Box::new(stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            streams.push(("stderr", Box::new(stderr)));
        }
        let console = ConsoleWatcher::attach(streams);

        let exit = Arc::new(ExitSignal::default());
        let reaper_exit = Arc::clone(&exit);
        let reaper = std::thread::Builder::new()
            .name(format!("reaper-{}", pid))
            .spawn(move || reap(child, pid, reaper_exit));
        if let Err(source) = reaper {
            // The child went down with the closure; make sure it does not outlive us.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
            return Err(HarnessError::LaunchFailure { program, source });
        }

        tracing::info!(pid, program = %program.display(), ?args, "started run");
        Ok(Self {
            program,
            args,
            pid,
            console,
            exit,
            stop_requested: AtomicBool::new(false),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Full argument vector the process was started with.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn state(&self) -> RunState {
        match self.exit.get() {
            None => RunState::Running,
            Some(code) if self.stop_requested.load(Ordering::SeqCst) => RunState::Stopped(code),
            Some(code) => RunState::Exited(code),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.exit.get().is_none()
    }

    /// Wait up to `timeout` for the process to exit.
    ///
    /// Blocks only the caller. Other runs keep going.
    pub fn await_exit(&self, timeout: Duration) -> bool {
        let exited = self.exit.wait(timeout);
        if !exited {
            tracing::debug!(pid = self.pid, ?timeout, "process still running after timeout");
        }
        exited
    }

    /// Exit code, once the exit has been observed. Signal deaths map to
    /// `128 + signal`. Never blocks.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit.get()
    }

    /// Wait up to `timeout` for `pattern` to appear in stdout or stderr,
    /// including output printed before this call.
    pub fn await_console_logs_for(&self, pattern: &str, timeout: Duration) -> bool {
        let found = self.console.await_pattern(pattern, timeout);
        if !found {
            tracing::debug!(
                pid = self.pid,
                pattern,
                ?timeout,
                exit_code = ?self.exit_code(),
                "pattern not seen in console output"
            );
        }
        found
    }

    /// Wait up to `timeout` for `text` to appear in a log file written by the
    /// server. A missing file counts as not yet written.
    pub fn await_logs_file_for(&self, path: &Path, text: &str, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if let Ok(contents) = std::fs::read_to_string(path) {
                if contents.contains(text) {
                    return true;
                }
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                tracing::debug!(path = %path.display(), text, "text not seen in log file");
                return false;
            }
            std::thread::sleep(LOG_FILE_POLL.min(timeout - elapsed));
        }
    }

    /// Everything the process has printed so far.
    pub fn output(&self) -> String {
        self.console.output()
    }

    /// Printed output as lines.
    pub fn logs(&self) -> Vec<String> {
        self.console.lines()
    }

    /// Ask the process to terminate (SIGTERM) without waiting for it.
    ///
    /// Confirm with [`Run::await_exit`].
    pub fn stop(&self) -> Result<()> {
        self.request_termination(libc::SIGTERM)
    }

    /// Forcefully terminate the process (SIGKILL) without waiting for it.
    pub fn kill(&self) -> Result<()> {
        self.request_termination(libc::SIGKILL)
    }

    fn request_termination(&self, signal: libc::c_int) -> Result<()> {
        if !self.is_alive() || has_exited(self.pid) {
            // Exited on its own; the reaper publishes it as such.
            return Ok(());
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        tracing::debug!(pid = self.pid, signal, "signalling process");

        let rc = unsafe { libc::kill(self.pid as libc::pid_t, signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            // Already gone; the reaper publishes the exit.
            return Ok(());
        }
        Err(HarnessError::Signal {
            pid: self.pid,
            source: err,
        })
    }
}

impl Drop for Run {
    fn drop(&mut self) {
        if !self.is_alive() {
            return;
        }
        tracing::warn!(pid = self.pid, "run dropped while process alive; killing");
        if let Err(e) = self.kill() {
            tracing::error!(pid = self.pid, error = %e, "failed to kill process on drop");
            return;
        }
        if !self.exit.wait(DROP_REAP_TIMEOUT) {
            tracing::error!(pid = self.pid, "process did not exit after SIGKILL");
        }
    }
}

/// Whether `pid` has terminated, without collecting its status.
///
/// The reaper may have collected it already, which also counts as exited.
fn has_exited(pid: u32) -> bool {
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        libc::waitid(
            libc::P_PID,
            pid as libc::id_t,
            &mut info,
            libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
        )
    };
    if rc != 0 {
        return true;
    }
    unsafe { info.si_pid() != 0 }
}

fn reap(mut child: Child, pid: u32, exit: Arc<ExitSignal>) {
    let code = match child.wait() {
        Ok(status) => exit_code_of(status),
        Err(e) => {
            tracing::error!(pid, error = %e, "failed to wait for process");
            -1
        }
    };
    tracing::info!(pid, code, "process exited");
    exit.publish(code);
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    fn sh(script: &str) -> Run {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", script])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Run::spawn(cmd, PathBuf::from("/bin/sh"), vec![script.to_string()]).unwrap()
    }

    #[test]
    fn test_exit_code_published_once() {
        let run = sh("echo hello; exit 3");
        assert!(run.await_exit(Duration::from_secs(10)));
        assert_eq!(run.exit_code(), Some(3));
        assert_eq!(run.state(), RunState::Exited(3));
        assert!(run.await_console_logs_for("hello", Duration::from_secs(5)));
        // Stable on repeated reads.
        assert!(run.await_exit(Duration::ZERO));
        assert_eq!(run.exit_code(), Some(3));
    }

    #[test]
    fn test_stderr_is_watched() {
        let run = sh("echo 'Started @12ms' >&2; exit 0");
        assert!(run.await_console_logs_for("Started @", Duration::from_secs(10)));
        assert!(run.await_exit(Duration::from_secs(10)));
        assert_eq!(run.exit_code(), Some(0));
    }

    #[test]
    fn test_timeouts_are_not_errors() {
        let run = sh("sleep 30");
        assert!(!run.await_exit(Duration::from_millis(100)));
        assert_eq!(run.exit_code(), None);
        assert!(!run.await_console_logs_for("never", Duration::from_millis(100)));
        assert!(run.is_alive());

        run.stop().unwrap();
        assert!(run.await_exit(Duration::from_secs(10)));
        assert_eq!(run.exit_code(), Some(128 + libc::SIGTERM));
        assert_eq!(run.state(), RunState::Stopped(128 + libc::SIGTERM));
        // Stopping an exited run is a no-op.
        run.stop().unwrap();
    }

    #[test]
    fn test_stop_after_natural_exit_stays_exited() {
        let run = sh("exit 3");
        let start = Instant::now();
        while !has_exited(run.pid()) {
            assert!(start.elapsed() < Duration::from_secs(10));
            std::thread::sleep(Duration::from_millis(5));
        }
        // Possibly before the reaper has published.
        run.stop().unwrap();
        assert!(run.await_exit(Duration::from_secs(10)));
        assert_eq!(run.state(), RunState::Exited(3));
    }

    #[test]
    fn test_has_exited_tracks_child() {
        let run = sh("sleep 30");
        assert!(!has_exited(run.pid()));
        run.kill().unwrap();
        assert!(run.await_exit(Duration::from_secs(10)));
        assert!(has_exited(run.pid()));
    }

    #[test]
    fn test_exit_before_pattern_resolves_false() {
        let run = sh("echo done");
        assert!(!run.await_console_logs_for("Started @", Duration::from_secs(30)));
        assert!(run.await_exit(Duration::from_secs(10)));
        assert_eq!(run.logs(), vec!["done".to_string()]);
    }

    #[test]
    fn test_spawn_failure_is_launch_failure() {
        let mut cmd = Command::new("/nonexistent/launcher");
        cmd.stdout(Stdio::piped());
        let err = Run::spawn(cmd, PathBuf::from("/nonexistent/launcher"), Vec::new())
            .err()
            .unwrap();
        assert!(matches!(err, HarnessError::LaunchFailure { .. }));
    }

    #[test]
    fn test_await_logs_file_for() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("server.log");
        let script = format!("sleep 0.2; echo 'ready for work' > '{}'; sleep 30", log.display());
        let run = sh(&script);
        assert!(run.await_logs_file_for(&log, "ready", Duration::from_secs(10)));
        assert!(!run.await_logs_file_for(&log, "absent", Duration::from_millis(200)));
        run.kill().unwrap();
        assert!(run.await_exit(Duration::from_secs(10)));
        assert_eq!(run.exit_code(), Some(128 + libc::SIGKILL));
    }

    #[test]
    fn test_drop_kills_live_process() {
        let run = sh("sleep 30");
        let pid = run.pid() as libc::pid_t;
        drop(run);
        // Reaped, so the pid no longer names our child.
        let rc = unsafe { libc::kill(pid, 0) };
        assert_eq!(rc, -1);
    }
}
