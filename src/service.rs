use crate::orchestrator::Orchestrator;
use crate::rate_limiter::RateLimiter;
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};
use zbus::{interface, message::Header};

pub const BUS_NAME: &str = "org.deskvox.Assistant";
pub const OBJECT_PATH: &str = "/org/deskvox/Assistant";

/// Session-bus control surface for the running assistant.
pub struct AssistantService {
    pub orchestrator: Orchestrator,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AssistantService {
    pub fn new(orchestrator: Orchestrator, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            orchestrator,
            rate_limiter,
        }
    }

    /// Start a pass on a fresh thread; the pipeline blocks for the whole
    /// utterance and must not run on the bus executor.
    fn activate_pass(&self) -> bool {
        if !self.orchestrator.is_running() || self.orchestrator.is_processing() {
            return false;
        }
        let orchestrator = self.orchestrator.clone();
        match thread::Builder::new()
            .name("deskvox-activate".to_string())
            .spawn(move || {
                orchestrator.trigger();
            }) {
            Ok(_) => true,
            Err(e) => {
                warn!("failed to spawn activation thread: {e}");
                false
            }
        }
    }

    fn submit(&self, sender: Option<&str>, text: &str) -> zbus::fdo::Result<(bool, String)> {
        if let Some(sender) = sender {
            if !self.rate_limiter.check(sender) {
                warn!(sender, "rate limited: SubmitCommand");
                return Err(zbus::fdo::Error::Failed("Rate limited".into()));
            }
        }
        if text.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs(
                "Command text cannot be empty".into(),
            ));
        }

        info!(text, "received typed command");
        let outcome = self.orchestrator.submit_text(text);
        Ok((outcome.queued, outcome.message))
    }
}

#[interface(name = "org.deskvox.Assistant")]
impl AssistantService {
    #[zbus(name = "Ping")]
    async fn ping(&self) -> String {
        "pong".to_string()
    }

    #[zbus(name = "GetVersion")]
    async fn get_version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    #[zbus(name = "GetStatus")]
    async fn get_status(&self) -> (String, bool, bool, u32, bool, u32) {
        let status = self.orchestrator.status();
        (
            status.lifecycle.to_string(),
            status.processing,
            status.should_exit,
            u32::try_from(status.queued).unwrap_or(u32::MAX),
            status.listening,
            status.streak,
        )
    }

    #[zbus(name = "Activate")]
    async fn activate(&self) -> bool {
        info!("received activate request");
        self.activate_pass()
    }

    #[zbus(name = "SubmitCommand")]
    async fn submit_command(
        &self,
        #[zbus(header)] header: Header<'_>,
        text: String,
    ) -> zbus::fdo::Result<(bool, String)> {
        let sender = header.sender().map(|s| s.to_string());
        self.submit(sender.as_deref(), &text)
    }

    #[zbus(name = "Shutdown")]
    async fn shutdown(&self) {
        info!("received shutdown request");
        self.orchestrator.request_exit();
    }
}
