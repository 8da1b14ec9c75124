use deskvox::action::{ActionDescriptor, ActionKind};
use deskvox::ear::{ListenPolicy, SpeechRecognizer};
use deskvox::engine::SpeechSynthesizer;
use deskvox::error::AssistantError;
use deskvox::events::{ExitReason, PipelineEvent, StatusSink};
use deskvox::executor::ExecutionEngine;
use deskvox::intent::{Intent, IntentClassifier, IntentRecord, RuleClassifier};
use deskvox::orchestrator::{
    Components, Lifecycle, Orchestrator, OrchestratorConfig, FAREWELL_MESSAGE, LISTENING_MESSAGE,
    NOTHING_HEARD_MESSAGE, NOT_UNDERSTOOD_MESSAGE, PASS_FAILED_MESSAGE, QUEUE_FULL_MESSAGE,
    READY_MESSAGE, RECOGNITION_FAILED_MESSAGE,
};
use deskvox::resolver::ActionResolver;
use deskvox::system::{ActionError, SystemActions};
use deskvox::wake::{DetectorStatus, TriggerCallback, TriggerSource};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

mockall::mock! {
    pub Recognizer {}
    impl SpeechRecognizer for Recognizer {
        fn recognize(&self, policy: &ListenPolicy) -> deskvox::error::Result<String>;
        fn cleanup(&self);
    }
}

mockall::mock! {
    pub Synthesizer {}
    impl SpeechSynthesizer for Synthesizer {
        fn speak(&self, text: &str, blocking: bool);
        fn stop(&self);
        fn cleanup(&self);
    }
}

mockall::mock! {
    pub Resolver {}
    impl ActionResolver for Resolver {
        fn resolve(&self, record: &IntentRecord) -> ActionDescriptor;
    }
}

mockall::mock! {
    pub Detector {}
    impl TriggerSource for Detector {
        fn start(&mut self, callback: TriggerCallback) -> deskvox::error::Result<()>;
        fn stop(&mut self);
        fn status(&self) -> Arc<DetectorStatus>;
    }
}

mockall::mock! {
    pub System {}
    impl SystemActions for System {
        fn launch_path(&self, path: &Path) -> Result<(), ActionError>;
        fn launch_name(&self, name: &str) -> Result<(), ActionError>;
        fn open_in_file_browser(&self, path: &Path) -> Result<(), ActionError>;
        fn open_url(&self, url: &str) -> Result<(), ActionError>;
        fn terminate_by_name(&self, name: &str) -> Result<usize, ActionError>;
        fn run_shell(&self, command: &str) -> Result<(), ActionError>;
    }
}

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<PipelineEvent>>,
}

impl StatusSink for EventLog {
    fn on_event(&self, event: &PipelineEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

impl EventLog {
    fn snapshot(&self) -> Vec<PipelineEvent> {
        self.events.lock().unwrap().clone()
    }

    fn contains(&self, wanted: &PipelineEvent) -> bool {
        self.events.lock().unwrap().iter().any(|e| e == wanted)
    }

    fn wait_for(&self, wanted: &PipelineEvent) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if self.contains(wanted) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

/// Phrases spoken so far, with their blocking flag.
type Spoken = Arc<Mutex<Vec<(String, bool)>>>;

struct Harness {
    orchestrator: Orchestrator,
    events: Arc<EventLog>,
    spoken: Spoken,
    synth_cleanups: Arc<AtomicUsize>,
    callback: Arc<Mutex<Option<TriggerCallback>>>,
}

impl Harness {
    fn spoken(&self) -> Vec<(String, bool)> {
        self.spoken.lock().unwrap().clone()
    }

    /// Phrases spoken after the greeting.
    fn replies(&self) -> Vec<(String, bool)> {
        self.spoken()
            .into_iter()
            .filter(|(text, _)| text != READY_MESSAGE)
            .collect()
    }

    fn run(&self) -> JoinHandle<deskvox::error::Result<()>> {
        let orchestrator = self.orchestrator.clone();
        let handle = thread::spawn(move || orchestrator.start());
        assert!(self.events.wait_for(&PipelineEvent::Ready), "assistant never became ready");
        handle
    }
}

fn idle_detector(slot: Arc<Mutex<Option<TriggerCallback>>>) -> MockDetector {
    let mut detector = MockDetector::new();
    detector
        .expect_status()
        .return_const(Arc::new(DetectorStatus::default()));
    detector.expect_start().returning(move |callback| {
        *slot.lock().unwrap() = Some(callback);
        Ok(())
    });
    detector.expect_stop().returning(|| ());
    detector
}

fn recognizer_hearing(text: &'static str) -> MockRecognizer {
    let mut recognizer = MockRecognizer::new();
    recognizer
        .expect_recognize()
        .returning(move |_| Ok(text.to_string()));
    recognizer.expect_cleanup().returning(|| ());
    recognizer
}

fn launching_resolver() -> MockResolver {
    let mut resolver = MockResolver::new();
    resolver
        .expect_resolve()
        .withf(|record| record.intent == Intent::OpenApp && record.field("target") == Some("notepad"))
        .returning(|_| ActionDescriptor::new(ActionKind::App, "gedit", "Opening notepad"));
    resolver
}

fn build(
    detector: Option<MockDetector>,
    recognizer: MockRecognizer,
    classifier: Arc<dyn IntentClassifier>,
    resolver: MockResolver,
    system: MockSystem,
    capacity: usize,
) -> Harness {
    let spoken: Spoken = Arc::default();
    let synth_cleanups = Arc::new(AtomicUsize::new(0));
    let callback = Arc::new(Mutex::new(None));

    let mut synthesizer = MockSynthesizer::new();
    let log = spoken.clone();
    synthesizer
        .expect_speak()
        .returning(move |text, blocking| log.lock().unwrap().push((text.to_string(), blocking)));
    synthesizer.expect_stop().returning(|| ());
    let cleanups = synth_cleanups.clone();
    synthesizer.expect_cleanup().returning(move || {
        cleanups.fetch_add(1, Ordering::SeqCst);
    });

    let detector = detector.unwrap_or_else(|| idle_detector(callback.clone()));
    let executor = ExecutionEngine::with_limits(
        Arc::new(system),
        capacity,
        Duration::from_millis(10),
        Duration::from_secs(2),
    );

    let orchestrator = Orchestrator::new(
        Components {
            detector: Box::new(detector),
            executor: Arc::new(executor),
            recognizer: Arc::new(recognizer),
            synthesizer: Arc::new(synthesizer),
            classifier,
            resolver: Arc::new(resolver),
        },
        OrchestratorConfig {
            idle_poll: Duration::from_millis(10),
            ..OrchestratorConfig::default()
        },
    );
    let events = Arc::new(EventLog::default());
    orchestrator.add_sink(events.clone());

    Harness {
        orchestrator,
        events,
        spoken,
        synth_cleanups,
        callback,
    }
}

fn rules() -> Arc<dyn IntentClassifier> {
    Arc::new(RuleClassifier::new().unwrap())
}

fn harness(recognizer: MockRecognizer, resolver: MockResolver, system: MockSystem) -> Harness {
    build(None, recognizer, rules(), resolver, system, 10)
}

fn finish(h: &Harness, handle: JoinHandle<deskvox::error::Result<()>>) {
    h.orchestrator.request_exit();
    handle.join().unwrap().unwrap();
    assert_eq!(h.orchestrator.lifecycle(), Lifecycle::Stopped);
}

#[test]
fn spoken_open_command_launches_and_confirms() {
    let mut system = MockSystem::new();
    system
        .expect_launch_name()
        .withf(|name| name == "gedit")
        .times(1)
        .returning(|_| Ok(()));
    let h = harness(recognizer_hearing("open notepad"), launching_resolver(), system);

    let handle = h.run();
    assert!(h.orchestrator.trigger());

    assert_eq!(
        h.replies(),
        vec![
            (LISTENING_MESSAGE.to_string(), true),
            ("Opening notepad".to_string(), false),
        ]
    );
    assert!(h.events.contains(&PipelineEvent::Executed {
        success: true,
        message: "Opening notepad".into(),
    }));
    assert!(!h.orchestrator.is_processing());
    finish(&h, handle);
}

#[test]
fn detector_callback_runs_a_pass() {
    let mut system = MockSystem::new();
    system.expect_launch_name().times(1).returning(|_| Ok(()));
    let h = harness(recognizer_hearing("open notepad"), launching_resolver(), system);

    let handle = h.run();
    let callback = h.callback.lock().unwrap().clone().expect("detector was started");
    callback();

    assert!(h.events.contains(&PipelineEvent::TriggerAccepted));
    assert!(h.spoken().contains(&("Opening notepad".to_string(), false)));
    finish(&h, handle);
}

#[test]
fn exit_keyword_stops_the_run_loop() {
    let mut recognizer = MockRecognizer::new();
    recognizer
        .expect_recognize()
        .times(1)
        .returning(|_| Ok("okay goodbye".to_string()));
    recognizer.expect_cleanup().times(1).returning(|| ());
    let h = harness(recognizer, MockResolver::new(), MockSystem::new());

    let handle = h.run();
    assert!(h.orchestrator.trigger());
    handle.join().unwrap().unwrap();

    assert!(h.orchestrator.should_exit());
    assert_eq!(h.orchestrator.lifecycle(), Lifecycle::Stopped);
    assert!(h.spoken().contains(&(FAREWELL_MESSAGE.to_string(), true)));
    assert!(h.events.contains(&PipelineEvent::ExitRequested {
        reason: ExitReason::Keyword
    }));
    assert!(h.events.contains(&PipelineEvent::Stopped));
    assert_eq!(h.synth_cleanups.load(Ordering::SeqCst), 1);
}

#[test]
fn exit_keyword_needs_a_whole_word() {
    let mut system = MockSystem::new();
    system.expect_launch_name().returning(|_| Ok(()));
    let mut resolver = MockResolver::new();
    resolver
        .expect_resolve()
        .returning(|_| ActionDescriptor::new(ActionKind::App, "exitool", "Opening exitool"));
    let h = harness(recognizer_hearing("open exitool"), resolver, system);

    let handle = h.run();
    assert!(h.orchestrator.trigger());
    assert!(!h.orchestrator.should_exit());
    assert!(h.spoken().contains(&("Opening exitool".to_string(), false)));
    finish(&h, handle);
}

#[test]
fn exit_action_speaks_farewell_and_blocks() {
    let mut classifier = MockClassifier::new();
    classifier
        .expect_classify()
        .returning(|_| IntentRecord::new(Intent::Exit, 0.8));
    let mut resolver = MockResolver::new();
    resolver
        .expect_resolve()
        .returning(|_| ActionDescriptor::exit());
    let h = build(
        None,
        recognizer_hearing("that will be all"),
        Arc::new(classifier),
        resolver,
        MockSystem::new(),
        10,
    );

    let handle = h.run();
    assert!(h.orchestrator.trigger());
    handle.join().unwrap().unwrap();

    assert!(h.events.contains(&PipelineEvent::Executed {
        success: true,
        message: FAREWELL_MESSAGE.into(),
    }));
    assert!(h.spoken().contains(&(FAREWELL_MESSAGE.to_string(), true)));
    assert!(h.events.contains(&PipelineEvent::ExitRequested {
        reason: ExitReason::Action
    }));
    assert_eq!(h.orchestrator.lifecycle(), Lifecycle::Stopped);
}

mockall::mock! {
    pub Classifier {}
    impl IntentClassifier for Classifier {
        fn classify(&self, text: &str) -> IntentRecord;
    }
}

#[test]
fn trigger_during_a_pass_is_dropped() {
    let (release, gate) = mpsc::channel::<()>();
    let gate = Mutex::new(gate);
    let mut recognizer = MockRecognizer::new();
    recognizer.expect_recognize().times(1).returning(move |_| {
        let _ = gate.lock().unwrap().recv_timeout(WAIT);
        Ok(String::new())
    });
    recognizer.expect_cleanup().returning(|| ());
    let h = harness(recognizer, MockResolver::new(), MockSystem::new());

    let handle = h.run();
    let first = {
        let orchestrator = h.orchestrator.clone();
        thread::spawn(move || orchestrator.trigger())
    };
    assert!(h.events.wait_for(&PipelineEvent::Listening));
    assert!(h.orchestrator.is_processing());

    assert!(!h.orchestrator.trigger());
    assert!(h.events.contains(&PipelineEvent::TriggerDropped));

    release.send(()).unwrap();
    assert!(first.join().unwrap());
    assert!(!h.orchestrator.is_processing());
    assert!(h.spoken().contains(&(NOTHING_HEARD_MESSAGE.to_string(), false)));
    finish(&h, handle);
}

#[test]
fn recognition_error_is_spoken() {
    let mut recognizer = MockRecognizer::new();
    recognizer
        .expect_recognize()
        .returning(|_| Err(AssistantError::Audio("device unplugged".into())));
    recognizer.expect_cleanup().returning(|| ());
    let h = harness(recognizer, MockResolver::new(), MockSystem::new());

    let handle = h.run();
    assert!(h.orchestrator.trigger());

    assert!(h
        .spoken()
        .contains(&(RECOGNITION_FAILED_MESSAGE.to_string(), false)));
    assert!(h
        .events
        .snapshot()
        .iter()
        .any(|e| matches!(e, PipelineEvent::PassFailed { cause } if cause.contains("device unplugged"))));
    assert!(!h.orchestrator.is_processing());
    finish(&h, handle);
}

#[test]
fn unknown_command_is_apologised_for() {
    let h = harness(
        recognizer_hearing("random gibberish that makes no sense"),
        MockResolver::new(),
        MockSystem::new(),
    );

    let handle = h.run();
    assert!(h.orchestrator.trigger());

    assert_eq!(
        h.replies().last(),
        Some(&(NOT_UNDERSTOOD_MESSAGE.to_string(), false))
    );
    assert!(h.events.contains(&PipelineEvent::NotUnderstood {
        text: "random gibberish that makes no sense".into()
    }));
    finish(&h, handle);
}

#[test]
fn error_action_feedback_is_apologised_for() {
    let mut resolver = MockResolver::new();
    resolver
        .expect_resolve()
        .returning(|_| ActionDescriptor::error("I could not find zorkmid on your system"));
    let h = harness(recognizer_hearing("open zorkmid"), resolver, MockSystem::new());

    let handle = h.run();
    assert!(h.orchestrator.trigger());

    assert_eq!(
        h.replies().last(),
        Some(&(
            "Sorry, I could not find zorkmid on your system".to_string(),
            false
        ))
    );
    finish(&h, handle);
}

#[test]
fn info_action_is_spoken_as_is() {
    let mut resolver = MockResolver::new();
    resolver
        .expect_resolve()
        .returning(|_| ActionDescriptor::bare(ActionKind::Info, "The time is 09:15 AM"));
    let h = harness(recognizer_hearing("what time is it"), resolver, MockSystem::new());

    let handle = h.run();
    assert!(h.orchestrator.trigger());

    assert_eq!(
        h.replies().last(),
        Some(&("The time is 09:15 AM".to_string(), false))
    );
    finish(&h, handle);
}

struct ExplodingClassifier;

impl IntentClassifier for ExplodingClassifier {
    fn classify(&self, _text: &str) -> IntentRecord {
        panic!("classifier exploded");
    }
}

#[test]
fn panicking_stage_is_contained() {
    let h = build(
        None,
        recognizer_hearing("open notepad"),
        Arc::new(ExplodingClassifier),
        MockResolver::new(),
        MockSystem::new(),
        10,
    );

    let handle = h.run();
    assert!(h.orchestrator.trigger());
    assert!(h.spoken().contains(&(PASS_FAILED_MESSAGE.to_string(), false)));
    assert!(!h.orchestrator.is_processing());

    // The next trigger is accepted again.
    assert!(h.orchestrator.trigger());
    assert!(h.orchestrator.is_running());
    finish(&h, handle);
}

#[test]
fn stop_is_idempotent_and_cleans_up_once() {
    let mut recognizer = MockRecognizer::new();
    recognizer.expect_cleanup().times(1).returning(|| ());
    let h = harness(recognizer, MockResolver::new(), MockSystem::new());

    h.orchestrator.stop();
    let handle = h.run();
    h.orchestrator.stop();
    handle.join().unwrap().unwrap();
    h.orchestrator.stop();

    assert_eq!(h.orchestrator.lifecycle(), Lifecycle::Stopped);
    assert_eq!(h.synth_cleanups.load(Ordering::SeqCst), 1);
    assert!(!h.orchestrator.trigger());
}

#[test]
fn start_while_running_is_a_no_op() {
    let h = harness(recognizer_hearing(""), MockResolver::new(), MockSystem::new());
    let handle = h.run();
    assert!(h.orchestrator.start().is_ok());
    assert!(h.orchestrator.is_running());
    finish(&h, handle);
}

#[test]
fn detector_start_failure_rolls_back() {
    let mut detector = MockDetector::new();
    detector
        .expect_status()
        .return_const(Arc::new(DetectorStatus::default()));
    detector
        .expect_start()
        .returning(|_| Err(AssistantError::Audio("no input device".into())));
    detector.expect_stop().returning(|| ());
    let mut recognizer = MockRecognizer::new();
    recognizer.expect_cleanup().times(1).returning(|| ());
    let h = build(
        Some(detector),
        recognizer,
        rules(),
        MockResolver::new(),
        MockSystem::new(),
        10,
    );

    let err = h.orchestrator.start().unwrap_err();
    assert!(matches!(err, AssistantError::Audio(_)));
    assert_eq!(h.orchestrator.lifecycle(), Lifecycle::Stopped);
    assert!(h.events.contains(&PipelineEvent::Stopped));
    assert!(!h.events.contains(&PipelineEvent::Ready));
}

#[test]
fn status_reflects_the_lifecycle() {
    let h = harness(recognizer_hearing(""), MockResolver::new(), MockSystem::new());
    assert_eq!(h.orchestrator.status().lifecycle, Lifecycle::Stopped);

    let handle = h.run();
    let status = h.orchestrator.status();
    assert_eq!(status.lifecycle, Lifecycle::Running);
    assert!(!status.processing);
    assert!(!status.should_exit);
    assert_eq!(status.queued, 0);
    finish(&h, handle);
}

#[test]
fn typed_commands_respect_the_queue_bound() {
    let (entered_tx, entered) = mpsc::channel::<()>();
    let (release, gate) = mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let gate = Mutex::new(gate);
    let mut system = MockSystem::new();
    system.expect_launch_name().times(2).returning(move |_| {
        let _ = entered_tx.lock().unwrap().send(());
        let _ = gate.lock().unwrap().recv_timeout(WAIT);
        Ok(())
    });
    let mut recognizer = MockRecognizer::new();
    recognizer.expect_cleanup().returning(|| ());
    let h = build(None, recognizer, rules(), launching_resolver(), system, 1);

    let handle = h.run();
    let first = h.orchestrator.submit_text("open notepad");
    assert!(first.queued);
    assert_eq!(first.message, "Opening notepad");
    entered.recv_timeout(WAIT).unwrap();

    // The worker is busy with the first action; one slot is left.
    assert!(h.orchestrator.submit_text("open notepad").queued);
    let third = h.orchestrator.submit_text("open notepad");
    assert!(!third.queued);
    assert_eq!(third.message, QUEUE_FULL_MESSAGE);

    release.send(()).unwrap();
    entered.recv_timeout(WAIT).unwrap();
    release.send(()).unwrap();
    finish(&h, handle);
}

#[test]
fn typed_commands_that_cannot_run_are_not_queued() {
    let mut recognizer = MockRecognizer::new();
    recognizer.expect_cleanup().returning(|| ());
    let h = harness(recognizer, MockResolver::new(), MockSystem::new());

    let handle = h.run();
    let empty = h.orchestrator.submit_text("   ");
    assert!(!empty.queued);
    let unknown = h.orchestrator.submit_text("random gibberish that makes no sense");
    assert!(!unknown.queued);
    assert_eq!(unknown.message, NOT_UNDERSTOOD_MESSAGE);
    assert_eq!(h.orchestrator.status().queued, 0);
    finish(&h, handle);
}

#[test]
fn typed_exit_keyword_requests_shutdown() {
    let mut recognizer = MockRecognizer::new();
    recognizer.expect_cleanup().returning(|| ());
    let h = harness(recognizer, MockResolver::new(), MockSystem::new());

    let handle = h.run();
    let outcome = h.orchestrator.submit_text("quit");
    assert!(!outcome.queued);
    assert_eq!(outcome.message, FAREWELL_MESSAGE);

    handle.join().unwrap().unwrap();
    assert_eq!(h.orchestrator.lifecycle(), Lifecycle::Stopped);
}

#[test]
fn start_returns_only_after_external_stop_finishes_teardown() {
    let mut recognizer = MockRecognizer::new();
    recognizer.expect_recognize().returning(|_| Ok(String::new()));
    recognizer
        .expect_cleanup()
        .returning(|| thread::sleep(Duration::from_millis(500)));
    let h = harness(recognizer, MockResolver::new(), MockSystem::new());

    let handle = h.run();
    let stopper = {
        let orchestrator = h.orchestrator.clone();
        thread::spawn(move || orchestrator.stop())
    };

    handle.join().unwrap().unwrap();
    assert_eq!(h.orchestrator.lifecycle(), Lifecycle::Stopped);
    assert_eq!(h.synth_cleanups.load(Ordering::SeqCst), 1);
    stopper.join().unwrap();
    assert!(h.events.contains(&PipelineEvent::Stopped));
}
