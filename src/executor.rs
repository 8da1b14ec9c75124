//! Execution engine: a bounded FIFO of actions serviced by one background
//! worker, plus a synchronous path that shares the same dispatcher.

use crate::action::{ActionDescriptor, ActionKind, ExecutionResult, EXIT_PAYLOAD};
use crate::error::{AssistantError, Result};
use crate::system::{ActionError, SystemActions};
use crate::worker::{panic_message, spawn_worker, Worker};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 10;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// An action waiting in the queue.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub action: ActionDescriptor,
    pub enqueued_at: Instant,
}

/// Maps an action to OS primitives. Never panics and never returns an error:
/// every failure becomes a failed [`ExecutionResult`].
pub struct Dispatcher {
    system: Arc<dyn SystemActions>,
}

impl Dispatcher {
    pub fn new(system: Arc<dyn SystemActions>) -> Self {
        Self { system }
    }

    pub fn dispatch(&self, action: &ActionDescriptor) -> ExecutionResult {
        debug!(kind = %action.kind, payload = ?action.payload, "dispatching");

        match catch_unwind(AssertUnwindSafe(|| self.run(action))) {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!(kind = %action.kind, error = %e, "action failed");
                ExecutionResult::failed(format!("Execution failed: {e}"))
            }
            Err(panic) => {
                let cause = panic_message(panic.as_ref());
                error!(kind = %action.kind, cause = %cause, "dispatch panicked");
                ExecutionResult::failed(format!("Execution failed: {cause}"))
            }
        }
    }

    fn run(&self, action: &ActionDescriptor) -> std::result::Result<ExecutionResult, ActionError> {
        let payload = || {
            action
                .payload
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .ok_or(ActionError::MissingPayload(action.kind))
        };

        match action.kind {
            ActionKind::App => {
                let target = payload()?;
                let path = Path::new(target);
                if path.exists() {
                    self.system.launch_path(path)?;
                } else {
                    self.system.launch_name(target)?;
                }
                Ok(ExecutionResult::ok(&action.message))
            }
            ActionKind::Folder => {
                let target = payload()?;
                let path = Path::new(target);
                if path.is_dir() {
                    self.system.open_in_file_browser(path)?;
                    Ok(ExecutionResult::ok(&action.message))
                } else {
                    Ok(ExecutionResult::failed(format!("Folder not found: {target}")))
                }
            }
            ActionKind::System => {
                let command = payload()?;
                if command != EXIT_PAYLOAD {
                    self.system.run_shell(command)?;
                }
                Ok(ExecutionResult::ok(&action.message))
            }
            ActionKind::Web => {
                self.system.open_url(payload()?)?;
                Ok(ExecutionResult::ok(&action.message))
            }
            ActionKind::CloseApp => {
                let name = payload()?;
                // Fire-and-forget: whatever the termination request reports,
                // the action counts as done.
                match self.system.terminate_by_name(name) {
                    Ok(count) => debug!(name, count, "close requested"),
                    Err(e) => warn!(name, error = %e, "close request failed"),
                }
                Ok(ExecutionResult::ok(&action.message))
            }
            ActionKind::Info => Ok(ExecutionResult::ok(&action.message)),
            ActionKind::Error | ActionKind::Unknown => {
                Ok(ExecutionResult::failed(&action.message))
            }
        }
    }
}

struct Shared {
    sender: Sender<QueuedRequest>,
    receiver: Receiver<QueuedRequest>,
    capacity: usize,
    running: AtomicBool,
    poll_interval: Duration,
    dispatcher: Dispatcher,
}

impl Shared {
    fn work(&self) {
        info!("execution worker started");
        while self.running.load(Ordering::SeqCst) {
            let request = match self.receiver.recv_timeout(self.poll_interval) {
                Ok(request) => request,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let waited = request.enqueued_at.elapsed();
            let result = self.dispatcher.dispatch(&request.action);
            info!(
                kind = %request.action.kind,
                success = result.success,
                waited_ms = waited.as_millis() as u64,
                message = %result.message,
                "queued action finished"
            );
        }
        info!("execution worker stopped");
    }
}

/// Bounded action queue plus the synchronous `execute_now` path.
pub struct ExecutionEngine {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker<()>>>,
    join_timeout: Duration,
}

impl ExecutionEngine {
    pub fn new(system: Arc<dyn SystemActions>) -> Self {
        Self::with_limits(
            system,
            DEFAULT_QUEUE_CAPACITY,
            DEFAULT_POLL_INTERVAL,
            DEFAULT_JOIN_TIMEOUT,
        )
    }

    pub fn with_limits(
        system: Arc<dyn SystemActions>,
        capacity: usize,
        poll_interval: Duration,
        join_timeout: Duration,
    ) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        Self {
            shared: Arc::new(Shared {
                sender,
                receiver,
                capacity,
                running: AtomicBool::new(false),
                poll_interval,
                dispatcher: Dispatcher::new(system),
            }),
            worker: Mutex::new(None),
            join_timeout,
        }
    }

    /// Start the background worker. No-op if it is already running.
    pub fn start(&self) -> Result<()> {
        let mut slot = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let shared = self.shared.clone();
        match spawn_worker("deskvox-exec", move || shared.work()) {
            Ok(worker) => {
                *slot = Some(worker);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(AssistantError::Io(e))
            }
        }
    }

    /// Stop the worker after its current item. Items still queued are
    /// abandoned.
    pub fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        self.shared.running.store(false, Ordering::SeqCst);

        if let Some(worker) = worker {
            worker.join_timeout(self.join_timeout);
        }

        let abandoned = self.shared.receiver.try_iter().count();
        if abandoned > 0 {
            warn!(abandoned, "queued actions dropped at shutdown");
        }
        info!("execution engine stopped");
    }

    /// Queue an action without blocking. Returns false if the queue is full;
    /// the action is then neither stored nor executed.
    pub fn enqueue(&self, action: ActionDescriptor) -> bool {
        let request = QueuedRequest {
            action,
            enqueued_at: Instant::now(),
        };
        match self.shared.sender.try_send(request) {
            Ok(()) => {
                debug!(queued = self.shared.sender.len(), "queued");
                true
            }
            Err(TrySendError::Full(request)) => {
                warn!(kind = %request.action.kind, capacity = self.shared.capacity, "queue full, action rejected");
                false
            }
            Err(TrySendError::Disconnected(request)) => {
                warn!(kind = %request.action.kind, "queue closed, action rejected");
                false
            }
        }
    }

    /// Run an action on the calling thread, bypassing the queue.
    pub fn execute_now(&self, action: &ActionDescriptor) -> ExecutionResult {
        let result = self.shared.dispatcher.dispatch(action);
        info!(kind = %action.kind, success = result.success, "executed");
        result
    }

    pub fn queued_len(&self) -> usize {
        self.shared.receiver.len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

impl Drop for ExecutionEngine {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_with: Option<String>,
        panic_on_url: bool,
        launches: AtomicUsize,
    }

    impl Recorder {
        fn record(&self, call: String) -> std::result::Result<(), ActionError> {
            self.calls.lock().unwrap().push(call);
            match &self.fail_with {
                Some(msg) => Err(ActionError::Other(msg.clone())),
                None => Ok(()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl SystemActions for Recorder {
        fn launch_path(&self, path: &Path) -> std::result::Result<(), ActionError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            self.record(format!("path:{}", path.display()))
        }
        fn launch_name(&self, name: &str) -> std::result::Result<(), ActionError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            self.record(format!("name:{name}"))
        }
        fn open_in_file_browser(&self, path: &Path) -> std::result::Result<(), ActionError> {
            self.record(format!("folder:{}", path.display()))
        }
        fn open_url(&self, url: &str) -> std::result::Result<(), ActionError> {
            if self.panic_on_url {
                panic!("browser exploded");
            }
            self.record(format!("url:{url}"))
        }
        fn terminate_by_name(&self, name: &str) -> std::result::Result<usize, ActionError> {
            self.record(format!("kill:{name}")).map(|_| 0)
        }
        fn run_shell(&self, command: &str) -> std::result::Result<(), ActionError> {
            self.record(format!("shell:{command}"))
        }
    }

    fn engine_with(recorder: Arc<Recorder>, capacity: usize) -> ExecutionEngine {
        ExecutionEngine::with_limits(
            recorder,
            capacity,
            Duration::from_millis(10),
            Duration::from_secs(2),
        )
    }

    #[test]
    fn error_kind_fails_without_os_call() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine_with(recorder.clone(), 4);

        let result = engine.execute_now(&ActionDescriptor::error("X"));

        assert_eq!(result, ExecutionResult { success: false, message: "X".into() });
        assert!(recorder.calls().is_empty());
    }

    #[test]
    fn unknown_kind_fails_without_os_call() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine_with(recorder.clone(), 4);

        let result = engine.execute_now(&ActionDescriptor::bare(
            ActionKind::Unknown,
            "I'm sorry, I didn't understand that command.",
        ));

        assert!(!result.success);
        assert_eq!(result.message, "I'm sorry, I didn't understand that command.");
        assert!(recorder.calls().is_empty());
    }

    #[test]
    fn info_succeeds_with_its_message() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine_with(recorder.clone(), 4);

        let result = engine.execute_now(&ActionDescriptor::new(
            ActionKind::Info,
            "5:00 PM",
            "It is 5 PM",
        ));

        assert_eq!(result, ExecutionResult { success: true, message: "It is 5 PM".into() });
        assert!(recorder.calls().is_empty());
    }

    #[test]
    fn app_falls_back_to_name_lookup() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine_with(recorder.clone(), 4);

        let result = engine.execute_now(&ActionDescriptor::new(
            ActionKind::App,
            "notepad.exe",
            "Opening notepad",
        ));

        assert!(result.success);
        assert_eq!(result.message, "Opening notepad");
        assert_eq!(recorder.calls(), vec!["name:notepad.exe".to_string()]);
    }

    #[test]
    fn app_with_existing_path_launches_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("tool");
        std::fs::write(&program, b"#!/bin/sh\n").unwrap();
        let recorder = Arc::new(Recorder::default());
        let engine = engine_with(recorder.clone(), 4);

        engine.execute_now(&ActionDescriptor::new(
            ActionKind::App,
            program.display().to_string(),
            "Opening tool",
        ));

        assert_eq!(recorder.calls(), vec![format!("path:{}", program.display())]);
    }

    #[test]
    fn missing_folder_fails_with_not_found() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine_with(recorder.clone(), 4);
        let missing = PathBuf::from("/definitely/not/here/deskvox");

        let result = engine.execute_now(&ActionDescriptor::new(
            ActionKind::Folder,
            missing.display().to_string(),
            "Opening here folder",
        ));

        assert!(!result.success);
        assert_eq!(result.message, "Folder not found: /definitely/not/here/deskvox");
        assert!(recorder.calls().is_empty());
    }

    #[test]
    fn existing_folder_is_opened() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let engine = engine_with(recorder.clone(), 4);

        let result = engine.execute_now(&ActionDescriptor::new(
            ActionKind::Folder,
            dir.path().display().to_string(),
            "Opening tmp folder",
        ));

        assert!(result.success);
        assert_eq!(recorder.calls(), vec![format!("folder:{}", dir.path().display())]);
    }

    #[test]
    fn exit_system_action_makes_no_os_call() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine_with(recorder.clone(), 4);

        let result = engine.execute_now(&ActionDescriptor::exit());

        assert!(result.success);
        assert_eq!(result.message, "Goodbye! Shutting down.");
        assert!(recorder.calls().is_empty());
    }

    #[test]
    fn os_failure_becomes_execution_failed() {
        let recorder = Arc::new(Recorder {
            fail_with: Some("permission denied".into()),
            ..Default::default()
        });
        let engine = engine_with(recorder, 4);

        let result = engine.execute_now(&ActionDescriptor::new(
            ActionKind::System,
            "loginctl lock-session",
            "Locking the computer",
        ));

        assert!(!result.success);
        assert_eq!(result.message, "Execution failed: permission denied");
    }

    #[test]
    fn close_app_ignores_termination_failure() {
        let recorder = Arc::new(Recorder {
            fail_with: Some("no such process".into()),
            ..Default::default()
        });
        let engine = engine_with(recorder.clone(), 4);

        let result = engine.execute_now(&ActionDescriptor::new(
            ActionKind::CloseApp,
            "firefox",
            "Closing firefox",
        ));

        assert!(result.success);
        assert_eq!(recorder.calls(), vec!["kill:firefox".to_string()]);
    }

    #[test]
    fn panic_in_primitive_is_contained() {
        let recorder = Arc::new(Recorder {
            panic_on_url: true,
            ..Default::default()
        });
        let engine = engine_with(recorder, 4);

        let result = engine.execute_now(&ActionDescriptor::new(
            ActionKind::Web,
            "https://example.com",
            "Opening example",
        ));

        assert!(!result.success);
        assert_eq!(result.message, "Execution failed: browser exploded");
    }

    #[test]
    fn missing_payload_fails() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine_with(recorder, 4);

        let result = engine.execute_now(&ActionDescriptor::bare(ActionKind::Web, "Opening"));

        assert!(!result.success);
        assert_eq!(result.message, "Execution failed: web action has no payload");
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine_with(recorder.clone(), 3);

        for i in 0..3 {
            assert!(engine.enqueue(ActionDescriptor::new(ActionKind::Info, "x", format!("item {i}"))));
        }
        let started = Instant::now();
        assert!(!engine.enqueue(ActionDescriptor::new(ActionKind::Info, "x", "overflow")));
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(engine.queued_len(), 3);
    }

    #[test]
    fn worker_drains_queue_in_order() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine_with(recorder.clone(), 10);
        engine.start().unwrap();

        for name in ["one", "two", "three"] {
            assert!(engine.enqueue(ActionDescriptor::new(ActionKind::App, name, name)));
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while recorder.launches.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        engine.stop();

        assert_eq!(
            recorder.calls(),
            vec!["name:one".to_string(), "name:two".to_string(), "name:three".to_string()]
        );
        assert_eq!(engine.queued_len(), 0);
    }

    #[test]
    fn stop_is_idempotent_and_start_is_reentrant() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine_with(recorder, 2);

        engine.start().unwrap();
        engine.start().unwrap();
        assert!(engine.is_running());

        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
    }

    #[test]
    fn freed_slot_is_reusable_once_worker_drains() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine_with(recorder.clone(), 1);

        assert!(engine.enqueue(ActionDescriptor::new(ActionKind::App, "first", "first")));
        assert!(!engine.enqueue(ActionDescriptor::new(ActionKind::App, "second", "second")));

        engine.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.queued_len() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(engine.enqueue(ActionDescriptor::new(ActionKind::App, "third", "third")));

        while recorder.launches.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        engine.stop();
        assert_eq!(
            recorder.calls(),
            vec!["name:first".to_string(), "name:third".to_string()]
        );
    }

    #[test]
    fn stop_abandons_pending_items() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine_with(recorder.clone(), 5);

        engine.enqueue(ActionDescriptor::new(ActionKind::App, "never", "never"));
        engine.stop();

        assert_eq!(engine.queued_len(), 0);
        assert!(recorder.calls().is_empty());
    }
}
