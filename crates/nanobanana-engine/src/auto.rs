//! Render-triggered runs. Everything happens synchronously inside the
//! render-completion callback and is capped by the call limiter.

use std::path::PathBuf;
use std::sync::Arc;

use nanobanana_contracts::host::{Preferences, RenderEvents, RenderSource};
use nanobanana_contracts::session::SessionState;

use crate::logger::Logger;
use crate::output;
use crate::task::{EditJob, TaskOutcome};
use crate::transport::Transport;

pub const AUTO_INPUT_SUBDIR: &str = "in";
pub const AUTO_OUTPUT_SUBDIR: &str = "out";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderSubscription {
    #[default]
    Unregistered,
    Registered,
}

/// Host collaborators the automatic path talks to.
pub struct AutoHost<'a> {
    pub prefs: &'a dyn Preferences,
    pub events: &'a mut dyn RenderEvents,
    pub render: &'a mut dyn RenderSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Auto mode is off.
    Skipped,
    /// Ceiling hit; auto mode was switched off.
    LimiterReached,
    MissingApiKey,
    RenderExportFailed(String),
    EditFailed(String),
    /// The remote call completed and was counted, but the write failed.
    SaveFailed(String),
    Saved { path: PathBuf, used: u64 },
}

pub fn render_input_path(session: &SessionState, frame: i64) -> PathBuf {
    session
        .auto_dir()
        .join(AUTO_INPUT_SUBDIR)
        .join(format!("render_{frame:04}.png"))
}

pub fn frame_output_path(session: &SessionState, frame: i64) -> PathBuf {
    session
        .auto_dir()
        .join(AUTO_OUTPUT_SUBDIR)
        .join(format!("nb_out_{frame:04}.png"))
}

#[derive(Debug, Default)]
pub struct AutoMode {
    subscription: RenderSubscription,
}

impl AutoMode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopts a subscription the host already holds.
    pub fn with_subscription(subscription: RenderSubscription) -> Self {
        Self { subscription }
    }

    pub fn subscription(&self) -> RenderSubscription {
        self.subscription
    }

    /// Toggles auto mode. Subscribes or unsubscribes at most once per
    /// transition, so repeated calls are no-ops.
    pub fn set_enabled(
        &mut self,
        enabled: bool,
        session: &mut SessionState,
        events: &mut dyn RenderEvents,
        logger: &mut Logger,
    ) -> anyhow::Result<()> {
        if enabled {
            if self.subscription == RenderSubscription::Unregistered {
                if let Err(err) = events.subscribe() {
                    session.auto_on_render = false;
                    logger.error(format!("Auto Run: subscription failed: {err:#}"));
                    return Err(err);
                }
                self.subscription = RenderSubscription::Registered;
            }
            session.auto_on_render = true;
            logger.info("Auto Run: enabled (subscribed to render completion)");
        } else {
            session.auto_on_render = false;
            self.unsubscribe(events);
            logger.info("Auto Run: disabled (unsubscribed from render completion)");
        }
        Ok(())
    }

    pub fn on_render_complete(
        &mut self,
        frame: i64,
        session: &mut SessionState,
        host: AutoHost<'_>,
        transport: Arc<dyn Transport>,
        logger: &mut Logger,
    ) -> FrameOutcome {
        if !session.auto_on_render {
            return FrameOutcome::Skipped;
        }

        if !session.limiter.should_proceed() {
            session.auto_on_render = false;
            self.unsubscribe(host.events);
            logger.info("Limiter reached. Auto disabled.");
            return FrameOutcome::LimiterReached;
        }

        let Some(api_key) = host
            .prefs
            .api_key()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
        else {
            logger.error("API key is not set. Skipping auto run.");
            return FrameOutcome::MissingApiKey;
        };

        let render_png = render_input_path(session, frame);
        let exported = render_png
            .parent()
            .map(output::ensure_dir)
            .transpose()
            .map_err(anyhow::Error::from)
            .and_then(|_| host.render.save_render(frame, &render_png));
        if let Err(err) = exported {
            let message = format!("Render export failed: {err:#}");
            logger.error(message.clone());
            return FrameOutcome::RenderExportFailed(message);
        }

        let outcome = EditJob::new(session.edit_request(&render_png), Some(&api_key), transport)
            .map(|job| job.run_inline());
        let image = match outcome {
            Ok(TaskOutcome::Completed(image)) => image,
            Ok(TaskOutcome::Failed(err)) | Err(err) => {
                let message = format!("Edit failed: {err}");
                logger.error(message.clone());
                return FrameOutcome::EditFailed(message);
            }
            Ok(TaskOutcome::Canceled) => {
                logger.error("Edit failed: canceled");
                return FrameOutcome::EditFailed("canceled".to_string());
            }
        };

        session.limiter = session.limiter.record();

        let out_png = frame_output_path(session, frame);
        if let Err(err) = output::write_bytes(&out_png, &image.bytes) {
            let message = format!("Output save failed: {err}");
            logger.error(message.clone());
            return FrameOutcome::SaveFailed(message);
        }

        logger.info(format!(
            "Frame {frame} -> {} (count {}/{})",
            out_png.display(),
            session.limiter.used,
            session.limiter.max
        ));
        FrameOutcome::Saved {
            path: out_png,
            used: session.limiter.used,
        }
    }

    fn unsubscribe(&mut self, events: &mut dyn RenderEvents) {
        if self.subscription == RenderSubscription::Registered {
            events.unsubscribe();
            self.subscription = RenderSubscription::Unregistered;
        }
    }
}
