//! Named background threads with a bounded join.
//!
//! `std::thread::JoinHandle::join` has no timeout, so every worker carries a
//! completion channel that fires when its closure returns or unwinds.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::warn;

pub struct Worker<T> {
    name: String,
    handle: JoinHandle<T>,
    done: Receiver<()>,
}

/// Sends on drop so the signal also fires while unwinding.
struct DoneSignal(Sender<()>);

impl Drop for DoneSignal {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

pub fn spawn_worker<T, F>(name: &str, f: F) -> std::io::Result<Worker<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (done_tx, done_rx) = mpsc::channel();
    let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
        let _signal = DoneSignal(done_tx);
        f()
    })?;

    Ok(Worker {
        name: name.to_string(),
        handle,
        done: done_rx,
    })
}

impl<T> Worker<T> {
    /// Join if the thread finishes within `timeout`.
    ///
    /// Returns `None` when the thread is still running (it is detached) or
    /// when it panicked.
    pub fn join_timeout(self, timeout: Duration) -> Option<T> {
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => match self.handle.join() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(worker = %self.name, "worker thread panicked");
                    None
                }
            },
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    worker = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "worker did not stop in time, detaching"
                );
                None
            }
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
