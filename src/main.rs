use clap::Parser;
use deskvox::backends::espeak::EspeakBackend;
use deskvox::config_loader::{Settings, SttBackend, WakeBackend};
use deskvox::ear::{self, Ear};
use deskvox::engine::AudioEngine;
use deskvox::executor::ExecutionEngine;
use deskvox::intent::RuleClassifier;
use deskvox::orchestrator::{Components, Orchestrator, OrchestratorConfig};
use deskvox::rate_limiter::RateLimiter;
use deskvox::resolver::DesktopResolver;
use deskvox::service::{AssistantService, BUS_NAME, OBJECT_PATH};
use deskvox::system::LinuxDesktop;
use deskvox::wake::TriggerDetector;
use deskvox::wyoming::WyomingTranscriber;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use zbus::connection::Builder;

/// Voice-driven desktop assistant daemon
#[derive(Parser)]
#[command(name = "deskvox")]
#[command(author = "StarTuz")]
#[command(version)]
#[command(about = "Listens for a wake phrase and runs spoken desktop commands", long_about = None)]
struct Cli {
    /// Extra configuration file, applied after the default locations
    #[arg(short, long)]
    config: Option<PathBuf>,
}

const SENDER_MAX_AGE: Duration = Duration::from_secs(600);

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    let _log_guard = init_logging(&settings);

    info!(version = env!("CARGO_PKG_VERSION"), "deskvox starting");

    let orchestrator = build(&settings).map_err(|e| {
        error!("startup failed: {e}");
        e
    })?;

    spawn_control_plane(orchestrator.clone(), &settings)?;

    orchestrator.start()?;
    info!("deskvox exited");
    Ok(())
}

/// Stderr plus a daily rolling file in `log_dir`. `RUST_LOG` overrides the
/// default `info` filter.
fn init_logging(settings: &Settings) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,zbus=warn,reqwest=warn,hyper=warn")
    });
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match std::fs::create_dir_all(&settings.log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&settings.log_dir, "deskvox.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            warn!(dir = %settings.log_dir, "file logging disabled: {e}");
            None
        }
    }
}

/// Construct every component once. Device and model failures abort.
fn build(settings: &Settings) -> Result<Orchestrator, Box<dyn Error>> {
    let needs_model =
        settings.wake_backend == WakeBackend::Offline || settings.stt_backend == SttBackend::Vosk;
    let model = if needs_model {
        match ear::load_model(&settings.vosk_model_path) {
            Ok(model) => Some(Arc::new(model)),
            Err(e) => {
                warn!("vosk model unavailable: {e}");
                None
            }
        }
    } else {
        None
    };

    let detector = TriggerDetector::new(settings, model.clone())?;
    let recognizer = Ear::from_settings(settings, model)?;

    let uses_wyoming = settings.stt_backend == SttBackend::Wyoming
        || detector.backend_label() == Some("networked");
    if uses_wyoming {
        probe_wyoming(settings);
    }

    let synthesizer = AudioEngine::new(
        Box::new(EspeakBackend::new(&settings.tts_binary, settings.speech_rate)),
        settings.speech_volume,
    )?;

    let executor = ExecutionEngine::with_limits(
        Arc::new(LinuxDesktop::new()),
        settings.queue_capacity,
        settings.worker_poll(),
        settings.join_timeout(),
    );

    Ok(Orchestrator::new(
        Components {
            detector: Box::new(detector),
            executor: Arc::new(executor),
            recognizer: Arc::new(recognizer),
            synthesizer: Arc::new(synthesizer),
            classifier: Arc::new(RuleClassifier::new()?),
            resolver: Arc::new(DesktopResolver::new(settings)),
        },
        OrchestratorConfig::from_settings(settings),
    ))
}

fn probe_wyoming(settings: &Settings) {
    let probe = WyomingTranscriber::new(
        &settings.wyoming_host,
        settings.wyoming_port,
        settings.wyoming_timeout(),
    )
    .and_then(|t| t.probe());
    if let Err(e) = probe {
        warn!(
            host = %settings.wyoming_host,
            port = settings.wyoming_port,
            "wyoming server not reachable yet: {e}"
        );
    }
}

/// D-Bus service and Ctrl-C handling on a small runtime of their own. The
/// orchestrator keeps the main thread.
fn spawn_control_plane(orchestrator: Orchestrator, settings: &Settings) -> std::io::Result<()> {
    let enable_dbus = settings.enable_dbus;
    let rate_limiter = Arc::new(RateLimiter::new(settings.rate_limit_commands));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("deskvox-bus")
        .enable_all()
        .build()?;

    thread::Builder::new()
        .name("deskvox-control-plane".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                let _conn = if enable_dbus {
                    serve_dbus(orchestrator.clone(), rate_limiter).await
                } else {
                    None
                };

                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        // The run loop on the main thread owns teardown.
                        info!("interrupt received, stopping");
                        orchestrator.request_exit();
                    }
                    Err(e) => warn!("cannot listen for Ctrl-C: {e}"),
                }

                std::future::pending::<()>().await;
            });
        })?;
    Ok(())
}

async fn serve_dbus(
    orchestrator: Orchestrator,
    rate_limiter: Arc<RateLimiter>,
) -> Option<zbus::Connection> {
    let service = AssistantService::new(orchestrator, rate_limiter.clone());
    let conn = async {
        Builder::session()?
            .name(BUS_NAME)?
            .serve_at(OBJECT_PATH, service)?
            .build()
            .await
    }
    .await;

    match conn {
        Ok(conn) => {
            info!("control interface running at {BUS_NAME}");
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(SENDER_MAX_AGE);
                loop {
                    interval.tick().await;
                    rate_limiter.cleanup(SENDER_MAX_AGE);
                }
            });
            Some(conn)
        }
        Err(e) => {
            warn!("D-Bus control interface unavailable: {e}");
            None
        }
    }
}
