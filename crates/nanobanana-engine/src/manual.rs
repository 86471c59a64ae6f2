//! User-triggered runs: a background worker polled from the host timer.
//!
//! Manual runs neither consult nor advance the call limiter; only the
//! automatic path is capped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nanobanana_contracts::host::{ImageSurfaces, Preferences, ProgressIndicator};
use nanobanana_contracts::session::{ApplyTarget, SessionState};

use crate::error::Result;
use crate::logger::Logger;
use crate::output::{self, ApplyOutcome, OutputManager};
use crate::task::{EditJob, TaskOutcome, TaskPoller, Tick};
use crate::transport::Transport;

pub const POLL_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Running { progress: u8 },
    Saved { path: PathBuf, apply: ApplyOutcome },
    Failed(String),
    Canceled,
    /// The terminal status was already reported by an earlier tick.
    Done,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running { .. })
    }
}

pub struct ManualRun {
    poller: TaskPoller,
    output: OutputManager,
    target: PathBuf,
    apply_target: ApplyTarget,
    open_in_image_editor: bool,
    progress: Box<dyn ProgressIndicator>,
    progress_active: bool,
}

impl ManualRun {
    /// Validates, resolves the destination and spawns the worker. A failed
    /// precondition is logged and returned; no thread is started.
    pub fn start(
        session: &SessionState,
        prefs: &dyn Preferences,
        transport: Arc<dyn Transport>,
        mut progress: Box<dyn ProgressIndicator>,
        logger: &mut Logger,
    ) -> Result<Self> {
        let base = session.base_image().unwrap_or_default();
        let transport_name = transport.name().to_string();
        let job = EditJob::new(
            session.edit_request(&base),
            prefs.api_key().as_deref(),
            transport,
        )
        .map_err(|err| {
            logger.error(format!("Manual run: {err}"));
            err
        })?;

        let output = OutputManager::from_session(session);
        let target = output.resolve(&base);
        let references = job.request().reference_paths.len();
        let poller = job.spawn().map_err(|err| {
            logger.error(format!("Manual run: {err}"));
            err
        })?;

        logger.info(format!(
            "Started {transport_name} edit of {} ({references} reference(s)) -> {}",
            base.display(),
            target.display()
        ));
        progress.start();
        Ok(Self {
            poller,
            output,
            target,
            apply_target: session.apply_target,
            open_in_image_editor: session.open_in_image_editor,
            progress,
            progress_active: true,
        })
    }

    /// One host timer tick. Never blocks.
    pub fn tick(&mut self, logger: &mut Logger, surfaces: &mut dyn ImageSurfaces) -> RunStatus {
        match self.poller.tick() {
            Tick::Idle => RunStatus::Done,
            Tick::Pending { progress } => {
                if let Some(percent) = progress {
                    self.progress.update(percent);
                }
                RunStatus::Running {
                    progress: self.poller.progress(),
                }
            }
            Tick::Finished(outcome) => {
                self.finish_progress();
                self.conclude(outcome, logger, surfaces)
            }
        }
    }

    /// Stops listening immediately; the worker's late result is discarded.
    pub fn cancel(&mut self, logger: &mut Logger) -> RunStatus {
        match self.poller.abandon() {
            Tick::Finished(_) => {
                self.finish_progress();
                logger.info("Canceled");
                RunStatus::Canceled
            }
            _ => RunStatus::Done,
        }
    }

    fn conclude(
        &mut self,
        outcome: TaskOutcome,
        logger: &mut Logger,
        surfaces: &mut dyn ImageSurfaces,
    ) -> RunStatus {
        match outcome {
            TaskOutcome::Completed(image) => match self.output.save(&image.bytes, &self.target) {
                Ok(path) => {
                    let apply = self.route(&path, logger, surfaces);
                    logger.info(format!("Saved: {}", path.display()));
                    RunStatus::Saved { path, apply }
                }
                Err(err) => {
                    let message = format!("Save failed: {err}");
                    logger.error(message.clone());
                    RunStatus::Failed(message)
                }
            },
            TaskOutcome::Failed(err) => {
                let message = err.to_string();
                logger.error(message.clone());
                RunStatus::Failed(message)
            }
            TaskOutcome::Canceled => {
                logger.info("Canceled");
                RunStatus::Canceled
            }
        }
    }

    fn route(
        &self,
        path: &Path,
        logger: &mut Logger,
        surfaces: &mut dyn ImageSurfaces,
    ) -> ApplyOutcome {
        let outcome = output::apply(path, self.apply_target, surfaces);
        if let ApplyOutcome::Failed(reason) = &outcome {
            logger.error(format!("Apply failed: {reason}"));
        }
        if self.open_in_image_editor && self.apply_target != ApplyTarget::ImageEditor {
            if let ApplyOutcome::Failed(reason) =
                output::apply(path, ApplyTarget::ImageEditor, surfaces)
            {
                tracing::debug!("image editor preview skipped: {reason}");
            }
        }
        outcome
    }

    fn finish_progress(&mut self) {
        if self.progress_active {
            self.progress_active = false;
            self.progress.finish();
        }
    }
}

impl Drop for ManualRun {
    fn drop(&mut self) {
        self.finish_progress();
    }
}
