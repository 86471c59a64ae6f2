use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nanobanana_contracts::host::{NoProgress, NoSurfaces, RenderEvents, RenderSource};
use nanobanana_contracts::limiter::LimiterState;
use nanobanana_contracts::logging::{LogLevel, LOG_FILE_NAME};
use nanobanana_contracts::session::{CollisionPolicy, SessionState, SessionStore};
use nanobanana_engine::auto::{AutoHost, FrameOutcome};
use nanobanana_engine::manual::RunStatus;
use nanobanana_engine::payload::ApiPayload;
use nanobanana_engine::transport::{send_with_retries, TransportErrorKind};
use nanobanana_engine::{
    ApiResult, AutoMode, CancelFlag, DryrunTransport, EditJob, EnvPreferences, ImageBytes, Logger,
    ManualRun, RetryPolicy, TaskOutcome, Tick, Transport,
};

/// Fails with a connection error a fixed number of times, then succeeds.
struct FlakyTransport {
    failures: u32,
    calls: AtomicU32,
    policy: RetryPolicy,
}

impl FlakyTransport {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
            policy: RetryPolicy {
                max_attempts: 5,
                attempt_timeout: Duration::from_secs(1),
                base_delay: Duration::from_millis(2),
                max_delay: Duration::from_millis(8),
            },
        }
    }
}

impl Transport for FlakyTransport {
    fn name(&self) -> &str {
        "flaky"
    }

    fn send(&self, payload: &ApiPayload, _api_key: &str, cancel: &CancelFlag) -> ApiResult {
        send_with_retries(&self.policy, cancel, |_attempt| {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return ApiResult::TransportError {
                    kind: TransportErrorKind::Connect,
                    detail: format!("connection refused (call {call})"),
                };
            }
            ApiResult::Success(ImageBytes {
                bytes: payload
                    .prompt_text()
                    .unwrap_or_default()
                    .as_bytes()
                    .to_vec(),
                mime_type: None,
            })
        })
    }
}

struct Toggle(u32);

impl RenderEvents for Toggle {
    fn subscribe(&mut self) -> anyhow::Result<()> {
        self.0 += 1;
        Ok(())
    }

    fn unsubscribe(&mut self) {}
}

struct PngRender;

impl RenderSource for PngRender {
    fn save_render(&mut self, _frame: i64, path: &Path) -> anyhow::Result<()> {
        write_png(path, 16, 16)
    }
}

fn write_png(path: &Path, width: u32, height: u32) -> anyhow::Result<()> {
    image::RgbImage::new(width, height).save(path)?;
    Ok(())
}

fn project(temp: &Path) -> anyhow::Result<SessionState> {
    write_png(&temp.join("render.png"), 48, 24)?;
    let store = SessionStore::new(temp.join("nanobanana-session.json"));
    store.update(|state| {
        state.prompt = "turn it into clay".to_string();
        state.base_path = "//render.png".to_string();
        state.reference_paths = vec!["//missing_ref.png".to_string()];
    })?;
    store.load()
}

#[test]
fn manual_dryrun_run_saves_image_with_base_dimensions() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let mut session = project(temp.path())?;
    session.output.collision = CollisionPolicy::Versioned;
    let mut logger = Logger::from_session(&session);
    let prefs = EnvPreferences::new().with_api_key("dry-key");
    let transport: Arc<dyn Transport> =
        Arc::new(DryrunTransport::new().with_latency(Duration::from_millis(20)));

    let mut run = ManualRun::start(
        &session,
        &prefs,
        transport,
        Box::new(NoProgress),
        &mut logger,
    )?;
    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        let status = run.tick(&mut logger, &mut NoSurfaces);
        if status.is_terminal() || Instant::now() > deadline {
            break status;
        }
        std::thread::sleep(Duration::from_millis(10));
    };

    let RunStatus::Saved { path, .. } = status else {
        anyhow::bail!("expected a saved result, got {status:?}");
    };
    assert_eq!(path, temp.path().join("nb_out_01.png"));
    let saved = image::open(&path)?;
    assert_eq!((saved.width(), saved.height()), (48, 24));

    logger.sync_into(&mut session);
    assert!(session.last_info.contains("Saved:"));
    let log = std::fs::read_to_string(temp.path().join("nb_out").join(LOG_FILE_NAME))?;
    assert!(log.lines().any(|line| line.contains("[INFO] Saved:")));
    Ok(())
}

#[test]
fn worker_retries_transient_failures_before_succeeding() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let session = project(temp.path())?;
    let transport = Arc::new(FlakyTransport::new(2));
    let job = EditJob::new(
        session.edit_request(&temp.path().join("render.png")),
        Some("key"),
        transport.clone(),
    )?;

    let mut poller = job.spawn()?;
    let deadline = Instant::now() + Duration::from_secs(10);
    let outcome = loop {
        match poller.tick() {
            Tick::Finished(outcome) => break outcome,
            Tick::Idle => anyhow::bail!("poller idle before a terminal message"),
            Tick::Pending { .. } if Instant::now() > deadline => anyhow::bail!("timed out"),
            Tick::Pending { .. } => std::thread::sleep(Duration::from_millis(5)),
        }
    };

    let TaskOutcome::Completed(image) = outcome else {
        anyhow::bail!("expected completion, got {outcome:?}");
    };
    assert!(String::from_utf8(image.bytes)?.starts_with("turn it into clay\n"));
    assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    Ok(())
}

#[test]
fn auto_mode_runs_until_the_limiter_stops_it() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let mut session = project(temp.path())?;
    session.limiter = LimiterState::new(true, 2, 0);
    let mut logger = Logger::new(false);
    let prefs = EnvPreferences::new().with_api_key("dry-key");
    let transport: Arc<dyn Transport> = Arc::new(DryrunTransport::new());
    let mut events = Toggle(0);
    let mut auto = AutoMode::new();
    auto.set_enabled(true, &mut session, &mut events, &mut logger)?;

    let mut outcomes = Vec::new();
    for frame in 1..=4 {
        outcomes.push(auto.on_render_complete(
            frame,
            &mut session,
            AutoHost {
                prefs: &prefs,
                events: &mut events,
                render: &mut PngRender,
            },
            transport.clone(),
            &mut logger,
        ));
    }

    assert!(matches!(outcomes[0], FrameOutcome::Saved { used: 1, .. }));
    assert!(matches!(outcomes[1], FrameOutcome::Saved { used: 2, .. }));
    assert_eq!(outcomes[2], FrameOutcome::LimiterReached);
    assert_eq!(outcomes[3], FrameOutcome::Skipped);
    assert!(!session.auto_on_render);
    assert_eq!(events.0, 1);
    let out_dir = temp.path().join("nb_out").join("out");
    assert!(out_dir.join("nb_out_0002.png").is_file());
    let last_info = logger.last(LogLevel::Info);
    assert!(last_info.ends_with("] [INFO] Limiter reached. Auto disabled."));

    session.limiter = session.limiter.reset();
    assert!(session.limiter.should_proceed());
    Ok(())
}
