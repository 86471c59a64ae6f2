//! Narrow interfaces the host application implements.
//!
//! The engine never talks to a 3D application directly. A host (the CLI, or an
//! embedding) provides these collaborators and owns the [`SessionState`].
//!
//! [`SessionState`]: crate::session::SessionState

use std::path::Path;

pub trait Preferences {
    /// Raw API key as stored; callers trim it.
    fn api_key(&self) -> Option<String>;
}

/// Source of render-completion events for the automatic mode.
pub trait RenderEvents {
    fn subscribe(&mut self) -> anyhow::Result<()>;
    fn unsubscribe(&mut self);
}

/// Access to the render result of the frame that just completed.
pub trait RenderSource {
    fn save_render(&mut self, frame: i64, path: &Path) -> anyhow::Result<()>;
}

/// Scene-visible destinations an output image can be routed into.
pub trait ImageSurfaces {
    fn show_in_image_editor(&mut self, path: &Path) -> anyhow::Result<()>;
    fn assign_material_texture(&mut self, path: &Path) -> anyhow::Result<()>;
    fn insert_compositor_node(&mut self, path: &Path) -> anyhow::Result<()>;
}

/// In-scene text block that receives verbose log lines.
pub trait TextBuffer: Send {
    fn write_line(&mut self, line: &str) -> anyhow::Result<()>;
}

/// Busy indicator shown while a manual run is in flight.
pub trait ProgressIndicator {
    fn start(&mut self);
    fn update(&mut self, percent: u8);
    fn finish(&mut self);
}

/// Surfaces that accept nothing; used by headless hosts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSurfaces;

impl ImageSurfaces for NoSurfaces {
    fn show_in_image_editor(&mut self, _path: &Path) -> anyhow::Result<()> {
        anyhow::bail!("no image editor available")
    }

    fn assign_material_texture(&mut self, _path: &Path) -> anyhow::Result<()> {
        anyhow::bail!("no active object with a material")
    }

    fn insert_compositor_node(&mut self, _path: &Path) -> anyhow::Result<()> {
        anyhow::bail!("no compositor node tree")
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressIndicator for NoProgress {
    fn start(&mut self) {}
    fn update(&mut self, _percent: u8) {}
    fn finish(&mut self) {}
}
