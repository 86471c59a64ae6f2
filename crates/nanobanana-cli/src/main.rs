use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use nanobanana_contracts::host::{NoSurfaces, ProgressIndicator, RenderEvents, RenderSource};
use nanobanana_contracts::limiter::LimiterState;
use nanobanana_contracts::logging::{LogFile, LogLevel};
use nanobanana_contracts::session::{
    ApplyTarget, CollisionPolicy, DefaultDirectory, EditMode, SessionState, SessionStore,
};
use nanobanana_engine::auto::{AutoHost, FrameOutcome, RenderSubscription};
use nanobanana_engine::manual::{RunStatus, POLL_INTERVAL_MS};
use nanobanana_engine::transport::DEFAULT_MODEL;
use nanobanana_engine::{
    AutoMode, DryrunTransport, EnvPreferences, HttpTransport, Logger, ManualRun, RetryPolicy,
    Transport,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_SESSION_FILE: &str = "nanobanana-session.json";

#[derive(Debug, Parser)]
#[command(
    name = "nanobanana",
    version,
    about = "Render-to-edit bridge for the Gemini image API"
)]
struct Cli {
    /// Session file holding prompt, paths, limiter and log status.
    #[arg(long, global = true, default_value = DEFAULT_SESSION_FILE)]
    session: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one manual edit with the session settings.
    Run(RunArgs),
    /// Turn render-triggered runs on or off.
    Auto {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Feed a finished render to the automatic path.
    RenderComplete(RenderCompleteArgs),
    Limiter {
        #[command(subcommand)]
        action: LimiterAction,
    },
    /// Print the tail of the log file, or the last message of one level.
    Log(LogArgs),
    /// Show the session, or update the fields given as flags.
    Config(ConfigArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Debug, Args)]
struct TransportArgs {
    /// Answer locally with a flat image instead of calling the API.
    #[arg(long)]
    dry_run: bool,
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,
    /// Retry transient failures with backoff instead of a single attempt.
    #[arg(long)]
    retry: bool,
    #[arg(long)]
    api_key: Option<String>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    transport: TransportArgs,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    base: Option<String>,
    #[arg(long = "ref")]
    references: Vec<String>,
    #[arg(long)]
    out: Option<String>,
    /// Cancel the request if it has not finished after this many seconds.
    #[arg(long)]
    cancel_after: Option<u64>,
}

#[derive(Debug, Args)]
struct RenderCompleteArgs {
    #[command(flatten)]
    transport: TransportArgs,
    #[arg(long)]
    frame: i64,
    /// Image file standing in for the render result.
    #[arg(long)]
    render: PathBuf,
}

#[derive(Debug, Subcommand)]
enum LimiterAction {
    Status,
    Reset,
    Set {
        #[arg(long)]
        max: Option<u64>,
        #[arg(long)]
        enabled: Option<bool>,
    },
}

#[derive(Debug, Args)]
struct LogArgs {
    #[arg(long, default_value_t = 20)]
    lines: usize,
    #[arg(long, value_enum)]
    level: Option<LevelArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LevelArg {
    Info,
    Error,
}

#[derive(Debug, Args)]
struct ConfigArgs {
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    base: Option<String>,
    #[arg(long = "ref")]
    references: Option<Vec<String>>,
    #[arg(long)]
    out: Option<String>,
    #[arg(long, value_enum)]
    apply: Option<ApplyArg>,
    #[arg(long, value_enum)]
    default_dir: Option<DefaultDirArg>,
    #[arg(long, value_enum)]
    collision: Option<CollisionArg>,
    #[arg(long)]
    file_name: Option<String>,
    #[arg(long)]
    auto_dir: Option<String>,
    #[arg(long)]
    log_dir: Option<String>,
    #[arg(long)]
    verbose: Option<bool>,
    #[arg(long)]
    open_in_image_editor: Option<bool>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Edit,
    Compose,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ApplyArg {
    None,
    ImageEditor,
    Material,
    Compositor,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DefaultDirArg {
    BaseImage,
    Temp,
    ProjectTextures,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CollisionArg {
    Overwrite,
    UniqueSuffix,
    Versioned,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("nanobanana error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_writer(std::io::stderr).with_target(false);
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .try_init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let store = SessionStore::new(&cli.session);
    let mut session = store.load()?;
    let mut logger = Logger::from_session(&session);

    let outcome = match cli.command {
        Command::Run(args) => run_manual(args, &mut session, &mut logger),
        Command::Auto { state } => {
            let mut auto = auto_mode_for(&session);
            auto.set_enabled(
                matches!(state, Toggle::On),
                &mut session,
                &mut CliRenderEvents,
                &mut logger,
            )
            .map(|()| 0)
        }
        Command::RenderComplete(args) => run_render_complete(args, &mut session, &mut logger),
        Command::Limiter { action } => Ok(run_limiter(action, &mut session, &mut logger)),
        Command::Log(args) => {
            print_log(&session, &args)?;
            return Ok(0);
        }
        Command::Config(args) => {
            if !apply_config(args, &mut session) {
                println!("{}", serde_json::to_string_pretty(&session)?);
                return Ok(0);
            }
            logger.info("Settings updated");
            Ok(0)
        }
    };

    // Failed runs still leave their last-status lines in the session.
    logger.sync_into(&mut session);
    store
        .save(&session)
        .with_context(|| format!("failed saving session {}", store.path().display()))?;
    outcome
}

fn run_manual(args: RunArgs, session: &mut SessionState, logger: &mut Logger) -> Result<i32> {
    if let Some(prompt) = args.prompt {
        session.prompt = prompt;
    }
    if let Some(base) = args.base {
        session.base_path = base;
    }
    if !args.references.is_empty() {
        session.reference_paths = args.references;
    }
    if let Some(out) = args.out {
        session.output_path = out;
    }

    let prefs = preferences(&args.transport);
    let transport = build_transport(&args.transport);
    let mut run = ManualRun::start(
        session,
        &prefs,
        transport,
        Box::new(StderrProgress::default()),
        logger,
    )?;

    let deadline = args
        .cancel_after
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut surfaces = NoSurfaces;
    loop {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            run.cancel(logger);
            return Ok(130);
        }
        match run.tick(logger, &mut surfaces) {
            RunStatus::Running { .. } => thread::sleep(Duration::from_millis(POLL_INTERVAL_MS)),
            RunStatus::Saved { path, .. } => {
                println!("{}", path.display());
                return Ok(0);
            }
            RunStatus::Canceled => return Ok(130),
            RunStatus::Failed(_) | RunStatus::Done => return Ok(1),
        }
    }
}

fn run_render_complete(
    args: RenderCompleteArgs,
    session: &mut SessionState,
    logger: &mut Logger,
) -> Result<i32> {
    if !args.render.is_file() {
        bail!("render file not found: {}", args.render.display());
    }
    let prefs = preferences(&args.transport);
    let transport = build_transport(&args.transport);
    let mut auto = auto_mode_for(session);
    let mut render = CopyRender {
        source: args.render,
    };

    let outcome = auto.on_render_complete(
        args.frame,
        session,
        AutoHost {
            prefs: &prefs,
            events: &mut CliRenderEvents,
            render: &mut render,
        },
        transport,
        logger,
    );
    Ok(match outcome {
        FrameOutcome::Saved { path, .. } => {
            println!("{}", path.display());
            0
        }
        FrameOutcome::Skipped | FrameOutcome::LimiterReached => 0,
        _ => 1,
    })
}

fn run_limiter(action: LimiterAction, session: &mut SessionState, logger: &mut Logger) -> i32 {
    match action {
        LimiterAction::Status => {}
        LimiterAction::Reset => {
            session.limiter = session.limiter.reset();
            logger.info("Limiter counter reset to 0");
        }
        LimiterAction::Set { max, enabled } => {
            let limiter = session.limiter;
            session.limiter = LimiterState::new(
                enabled.unwrap_or(limiter.enabled),
                max.unwrap_or(limiter.max),
                limiter.used,
            );
            let state = if session.limiter.enabled {
                "enabled"
            } else {
                "disabled"
            };
            logger.info(format!("Limiter {state} (max {})", session.limiter.max));
        }
    }
    let limiter = session.limiter;
    match limiter.remaining() {
        Some(remaining) => println!(
            "used {}/{} ({remaining} remaining), auto {}",
            limiter.used,
            limiter.max,
            on_off(session.auto_on_render)
        ),
        None => println!(
            "used {} (limiter off), auto {}",
            limiter.used,
            on_off(session.auto_on_render)
        ),
    }
    0
}

fn print_log(session: &SessionState, args: &LogArgs) -> Result<()> {
    for line in log_lines(session, args)? {
        println!("{line}");
    }
    if args.level.is_none() && !session.last_error.is_empty() {
        eprintln!("last error: {}", session.last_error);
    }
    Ok(())
}

/// With `--level`, only the session's last message of that level.
fn log_lines(session: &SessionState, args: &LogArgs) -> Result<Vec<String>> {
    if let Some(level) = args.level {
        let last = session.last_message(level.into());
        if last.is_empty() {
            return Ok(Vec::new());
        }
        return Ok(vec![last.to_string()]);
    }

    let log = LogFile::in_dir(session.log_dir());
    let content = match fs::read_to_string(log.path()) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed reading {}", log.path().display()));
        }
    };
    let all: Vec<&str> = content.lines().collect();
    let tail = &all[all.len().saturating_sub(args.lines)..];
    Ok(tail.iter().map(|line| line.to_string()).collect())
}

/// Applies every flag that was given; returns whether any flag was present.
fn apply_config(args: ConfigArgs, session: &mut SessionState) -> bool {
    let ConfigArgs {
        mode,
        prompt,
        base,
        references,
        out,
        apply,
        default_dir,
        collision,
        file_name,
        auto_dir,
        log_dir,
        verbose,
        open_in_image_editor,
    } = args;
    let mut touched = false;

    if let Some(mode) = mode {
        session.mode = mode.into();
        touched = true;
    }
    if let Some(apply) = apply {
        session.apply_target = apply.into();
        touched = true;
    }
    if let Some(default_dir) = default_dir {
        session.output.default_dir = default_dir.into();
        touched = true;
    }
    if let Some(collision) = collision {
        session.output.collision = collision.into();
        touched = true;
    }
    if let Some(verbose) = verbose {
        session.verbose = verbose;
        touched = true;
    }
    if let Some(open) = open_in_image_editor {
        session.open_in_image_editor = open;
        touched = true;
    }
    if let Some(references) = references {
        session.reference_paths = references;
        touched = true;
    }

    let text_fields = [
        (prompt, &mut session.prompt),
        (base, &mut session.base_path),
        (out, &mut session.output_path),
        (file_name, &mut session.output.file_name),
        (auto_dir, &mut session.auto_out_dir),
        (log_dir, &mut session.log_dir),
    ];
    for (value, field) in text_fields {
        if let Some(value) = value {
            *field = value;
            touched = true;
        }
    }
    touched
}

impl From<ModeArg> for EditMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Edit => Self::Edit,
            ModeArg::Compose => Self::Compose,
        }
    }
}

impl From<LevelArg> for LogLevel {
    fn from(value: LevelArg) -> Self {
        match value {
            LevelArg::Info => Self::Info,
            LevelArg::Error => Self::Error,
        }
    }
}

impl From<ApplyArg> for ApplyTarget {
    fn from(value: ApplyArg) -> Self {
        match value {
            ApplyArg::None => Self::None,
            ApplyArg::ImageEditor => Self::ImageEditor,
            ApplyArg::Material => Self::Material,
            ApplyArg::Compositor => Self::Compositor,
        }
    }
}

impl From<DefaultDirArg> for DefaultDirectory {
    fn from(value: DefaultDirArg) -> Self {
        match value {
            DefaultDirArg::BaseImage => Self::BaseImage,
            DefaultDirArg::Temp => Self::Temp,
            DefaultDirArg::ProjectTextures => Self::ProjectTextures,
        }
    }
}

impl From<CollisionArg> for CollisionPolicy {
    fn from(value: CollisionArg) -> Self {
        match value {
            CollisionArg::Overwrite => Self::Overwrite,
            CollisionArg::UniqueSuffix => Self::UniqueSuffix,
            CollisionArg::Versioned => Self::Versioned,
        }
    }
}

fn preferences(args: &TransportArgs) -> EnvPreferences {
    match &args.api_key {
        Some(key) => EnvPreferences::new().with_api_key(key),
        None if args.dry_run => EnvPreferences::new().with_api_key("dry-run"),
        None => EnvPreferences::new(),
    }
}

fn build_transport(args: &TransportArgs) -> Arc<dyn Transport> {
    if args.dry_run {
        return Arc::new(DryrunTransport::new());
    }
    let policy = if args.retry {
        RetryPolicy::retrying()
    } else {
        RetryPolicy::single_shot()
    };
    Arc::new(HttpTransport::new(policy).with_model(&args.model))
}

/// A one-shot process cannot hold a live subscription; the session flag
/// stands in for it.
fn auto_mode_for(session: &SessionState) -> AutoMode {
    AutoMode::with_subscription(if session.auto_on_render {
        RenderSubscription::Registered
    } else {
        RenderSubscription::Unregistered
    })
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

struct CliRenderEvents;

impl RenderEvents for CliRenderEvents {
    fn subscribe(&mut self) -> Result<()> {
        tracing::debug!("render-complete handler registered");
        Ok(())
    }

    fn unsubscribe(&mut self) {
        tracing::debug!("render-complete handler removed");
    }
}

struct CopyRender {
    source: PathBuf,
}

impl RenderSource for CopyRender {
    fn save_render(&mut self, _frame: i64, path: &Path) -> Result<()> {
        fs::copy(&self.source, path).with_context(|| {
            format!(
                "failed copying {} to {}",
                self.source.display(),
                path.display()
            )
        })?;
        Ok(())
    }
}

#[derive(Default)]
struct StderrProgress {
    last: Option<u8>,
}

impl ProgressIndicator for StderrProgress {
    fn start(&mut self) {
        eprint!("working");
    }

    fn update(&mut self, percent: u8) {
        if self.last != Some(percent) {
            self.last = Some(percent);
            eprint!(" {percent}%");
        }
    }

    fn finish(&mut self) {
        eprintln!();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use clap::Parser;
    use nanobanana_contracts::host::RenderSource;
    use nanobanana_contracts::logging::{LogEntry, LogFile, LogLevel};
    use nanobanana_contracts::session::{CollisionPolicy, EditMode, SessionState};
    use nanobanana_engine::auto::RenderSubscription;

    use super::{
        apply_config, auto_mode_for, log_lines, Cli, Command, CopyRender, DEFAULT_SESSION_FILE,
    };

    fn config_args(argv: &[&str]) -> anyhow::Result<super::ConfigArgs> {
        let mut full = vec!["nanobanana", "config"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full)?.command {
            Command::Config(args) => Ok(args),
            other => anyhow::bail!("unexpected command {other:?}"),
        }
    }

    fn log_args(argv: &[&str]) -> anyhow::Result<super::LogArgs> {
        let mut full = vec!["nanobanana", "log"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full)?.command {
            Command::Log(args) => Ok(args),
            other => anyhow::bail!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn session_flag_defaults_and_is_global() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["nanobanana", "limiter", "status"])?;
        assert_eq!(cli.session, PathBuf::from(DEFAULT_SESSION_FILE));

        let cli = Cli::try_parse_from(["nanobanana", "auto", "on", "--session", "/tmp/s.json"])?;
        assert_eq!(cli.session, PathBuf::from("/tmp/s.json"));
        Ok(())
    }

    #[test]
    fn run_accepts_repeated_references() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "nanobanana",
            "run",
            "--dry-run",
            "--ref",
            "a.png",
            "--ref",
            "b.png",
        ])?;
        match cli.command {
            Command::Run(args) => {
                assert!(args.transport.dry_run);
                assert_eq!(args.references, vec!["a.png", "b.png"]);
            }
            other => anyhow::bail!("unexpected command {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn config_without_flags_changes_nothing() -> anyhow::Result<()> {
        let mut session = SessionState::default();
        assert!(!apply_config(config_args(&[])?, &mut session));
        assert_eq!(session, SessionState::default());
        Ok(())
    }

    #[test]
    fn config_flags_update_session_fields() -> anyhow::Result<()> {
        let mut session = SessionState::default();
        let args = config_args(&[
            "--mode",
            "edit",
            "--collision",
            "versioned",
            "--prompt",
            "watercolor",
            "--auto-dir",
            "//frames",
            "--verbose",
            "false",
        ])?;
        assert!(apply_config(args, &mut session));
        assert_eq!(session.mode, EditMode::Edit);
        assert_eq!(session.output.collision, CollisionPolicy::Versioned);
        assert_eq!(session.prompt, "watercolor");
        assert_eq!(session.auto_out_dir, "//frames");
        assert!(!session.verbose);
        Ok(())
    }

    #[test]
    fn log_level_prints_the_last_message_of_that_level() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut session = SessionState {
            project_dir: Some(temp.path().to_path_buf()),
            ..SessionState::default()
        };
        session.set_last_message(LogLevel::Info, "[t] [INFO] Saved: out.png".to_string());
        session.set_last_message(LogLevel::Error, "[t] [ERROR] quota".to_string());

        let info = log_lines(&session, &log_args(&["--level", "info"])?)?;
        assert_eq!(info, vec!["[t] [INFO] Saved: out.png"]);
        let error = log_lines(&session, &log_args(&["--level", "error"])?)?;
        assert_eq!(error, vec!["[t] [ERROR] quota"]);

        session.set_last_message(LogLevel::Error, String::new());
        assert!(log_lines(&session, &log_args(&["--level", "error"])?)?.is_empty());
        Ok(())
    }

    #[test]
    fn log_without_level_tails_the_log_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let session = SessionState {
            project_dir: Some(temp.path().to_path_buf()),
            ..SessionState::default()
        };
        assert!(log_lines(&session, &log_args(&[])?)?.is_empty());

        let file = LogFile::in_dir(session.log_dir());
        for message in ["one", "two", "three"] {
            file.append(&LogEntry::now(LogLevel::Info, message))?;
        }
        let tail = log_lines(&session, &log_args(&["--lines", "2"])?)?;
        assert_eq!(tail.len(), 2);
        assert!(tail[0].ends_with("[INFO] two"));
        assert!(tail[1].ends_with("[INFO] three"));
        Ok(())
    }

    #[test]
    fn auto_mode_mirrors_session_flag() {
        let mut session = SessionState::default();
        assert_eq!(
            auto_mode_for(&session).subscription(),
            RenderSubscription::Unregistered
        );
        session.auto_on_render = true;
        assert_eq!(
            auto_mode_for(&session).subscription(),
            RenderSubscription::Registered
        );
    }

    #[test]
    fn copy_render_exports_the_given_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = temp.path().join("frame.png");
        fs::write(&source, b"pixels")?;
        let target = temp.path().join("render_0001.png");

        CopyRender { source }.save_render(1, &target)?;
        assert_eq!(fs::read(&target)?, b"pixels");

        let mut missing = CopyRender {
            source: temp.path().join("absent.png"),
        };
        assert!(missing.save_render(2, &target).is_err());
        Ok(())
    }
}
