//! Console watcher for a running distribution.
//!
//! Each output stream of the child gets a drain thread that appends raw
//! chunks to one shared buffer. Callers wait for literal substrings with a
//! bound. Waits register a one-shot channel keyed by id, and the drain side
//! resolves them under the same lock it appends under, so a pattern printed
//! before the wait was registered is still found and no wakeup is lost.
//!
//! When every stream has closed, pending and future waits for unseen
//! patterns resolve `false`, the same outcome as a timeout.

use std::collections::HashMap;
use std::io::Read;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

const CHUNK_SIZE: usize = 8 * 1024;

struct Waiter {
    pattern: String,
    tx: SyncSender<bool>,
}

#[derive(Default)]
struct WatchState {
    buffer: String,
    open_streams: usize,
    waiters: HashMap<u64, Waiter>,
    next_id: u64,
}

impl WatchState {
    fn append(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let old_len = self.buffer.len();
        self.buffer.push_str(text);

        let buffer = &self.buffer;
        self.waiters.retain(|_, waiter| {
            // Re-scan only the new tail plus enough overlap for a match that
            // straddles the previous append.
            let mut from = old_len.saturating_sub(waiter.pattern.len().saturating_sub(1));
            while !buffer.is_char_boundary(from) {
                from -= 1;
            }
            if buffer[from..].contains(waiter.pattern.as_str()) {
                let _ = waiter.tx.try_send(true);
                false
            } else {
                true
            }
        });
    }

    fn close_stream(&mut self) {
        self.open_streams = self.open_streams.saturating_sub(1);
        if self.open_streams == 0 {
            for (_, waiter) in self.waiters.drain() {
                let _ = waiter.tx.try_send(false);
            }
        }
    }
}

/// Shared, continuously drained view of a child's stdout and stderr.
pub struct ConsoleWatcher {
    state: Arc<Mutex<WatchState>>,
    drains: Vec<JoinHandle<()>>,
}

impl ConsoleWatcher {
    /// Start draining every given stream on its own thread.
    pub fn attach<R>(streams: Vec<(&'static str, R)>) -> Self
    where
        R: Read + Send + 'static,
    {
        let state = Arc::new(Mutex::new(WatchState {
            open_streams: streams.len(),
            ..WatchState::default()
        }));

        let mut drains = Vec::with_capacity(streams.len());
        for (name, stream) in streams {
            let shared = Arc::clone(&state);
            let spawned = std::thread::Builder::new()
                .name(format!("console-{}", name))
                .spawn(move || drain(name, stream, shared));
            match spawned {
                Ok(handle) => drains.push(handle),
                Err(e) => {
                    // A stream without a drain will never close on its own.
                    tracing::error!(stream = name, error = %e, "failed to spawn console drain thread");
                    lock(&state).close_stream();
                }
            }
        }

        Self { state, drains }
    }

    fn state(&self) -> MutexGuard<'_, WatchState> {
        lock(&self.state)
    }

    /// Wait up to `timeout` for `pattern` to appear anywhere in the output.
    ///
    /// Matching is literal and case-sensitive over everything captured so
    /// far, so repeated waits over the same history all succeed.
    pub fn await_pattern(&self, pattern: &str, timeout: Duration) -> bool {
        let (id, rx) = {
            let mut state = self.state();
            if state.buffer.contains(pattern) {
                return true;
            }
            if state.open_streams == 0 {
                return false;
            }
            let (tx, rx) = mpsc::sync_channel(1);
            let id = state.next_id;
            state.next_id += 1;
            state.waiters.insert(
                id,
                Waiter {
                    pattern: pattern.to_string(),
                    tx,
                },
            );
            (id, rx)
        };

        match rx.recv_timeout(timeout) {
            Ok(found) => found,
            Err(RecvTimeoutError::Disconnected) => false,
            Err(RecvTimeoutError::Timeout) => self.abandon(id, &rx),
        }
    }

    /// Drop a timed-out registration. A resolution that raced the timeout is
    /// still honoured.
    fn abandon(&self, id: u64, rx: &Receiver<bool>) -> bool {
        self.state().waiters.remove(&id);
        rx.try_recv().unwrap_or(false)
    }

    /// Everything captured so far.
    pub fn output(&self) -> String {
        self.state().buffer.clone()
    }

    /// Captured output split into lines.
    pub fn lines(&self) -> Vec<String> {
        self.state().buffer.lines().map(str::to_string).collect()
    }

    /// Whether every stream has reached end of file.
    pub fn is_closed(&self) -> bool {
        self.state().open_streams == 0
    }

    #[cfg(test)]
    fn pending_waiters(&self) -> usize {
        self.state().waiters.len()
    }
}

impl Drop for ConsoleWatcher {
    fn drop(&mut self) {
        // Drains end on EOF. Only join the ones that already have, so a
        // grandchild holding the pipe open cannot wedge the caller.
        for handle in self.drains.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

fn drain<R: Read>(name: &'static str, mut stream: R, state: Arc<Mutex<WatchState>>) {
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&chunk[..n]);
                let text = decode(&mut pending);
                tracing::trace!(stream = name, bytes = n, "console output");
                lock(&state).append(&text);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(stream = name, error = %e, "console read failed");
                break;
            }
        }
    }

    let mut state = lock(&state);
    if !pending.is_empty() {
        state.append(&String::from_utf8_lossy(&pending));
    }
    state.close_stream();
    tracing::debug!(stream = name, "console stream closed");
}

fn lock(state: &Mutex<WatchState>) -> MutexGuard<'_, WatchState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Decode as much of `pending` as possible, keeping an incomplete trailing
/// UTF-8 sequence for the next chunk. Invalid bytes become U+FFFD.
fn decode(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}
