//! Output Manager: where results land, how collisions resolve, and where
//! they are routed afterwards.

use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use nanobanana_contracts::host::ImageSurfaces;
use nanobanana_contracts::session::{
    ApplyTarget, CollisionPolicy, DefaultDirectory, OutputSettings, SessionState,
    DEFAULT_OUTPUT_FILE_NAME,
};

use crate::error::{EditError, Result};

pub const TEMP_SUBDIR: &str = "nanobanana";
pub const PROJECT_TEXTURES_SUBDIR: &str = "textures";
const UNIQUE_TOKEN_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Skipped,
    Applied(ApplyTarget),
    Failed(String),
}

/// Output settings resolved against one session.
#[derive(Debug, Clone)]
pub struct OutputManager {
    settings: OutputSettings,
    explicit: Option<PathBuf>,
    project_root: PathBuf,
}

impl OutputManager {
    pub fn from_session(session: &SessionState) -> Self {
        Self {
            settings: session.output.clone(),
            explicit: session.resolve_path(&session.output_path),
            project_root: session.project_root(),
        }
    }

    /// Destination before the collision policy is applied.
    pub fn resolve(&self, base: &Path) -> PathBuf {
        if let Some(explicit) = &self.explicit {
            if is_dir_like(explicit) {
                return explicit.join(self.file_name());
            }
            let name = explicit
                .file_name()
                .and_then(|name| name.to_str())
                .map(sanitize_file_name)
                .unwrap_or_else(|| self.file_name());
            return match explicit.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.join(name),
                _ => PathBuf::from(name),
            };
        }
        self.default_dir(base).join(self.file_name())
    }

    /// Writes `bytes` at `target`, or at the path the collision policy picks.
    pub fn save(&self, bytes: &[u8], target: &Path) -> Result<PathBuf> {
        let dir = target
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        ensure_dir(&dir)?;

        let (stem, ext) = split_name(target);
        let path = match self.settings.collision {
            CollisionPolicy::Overwrite => target.to_path_buf(),
            CollisionPolicy::UniqueSuffix if target.exists() => unique_path(&dir, &stem, &ext),
            CollisionPolicy::UniqueSuffix => target.to_path_buf(),
            CollisionPolicy::Versioned => next_versioned_path(&dir, &stem, &ext),
        };
        write_bytes(&path, bytes)?;
        Ok(path)
    }

    fn file_name(&self) -> String {
        sanitize_file_name(&self.settings.file_name)
    }

    fn default_dir(&self, base: &Path) -> PathBuf {
        match self.settings.default_dir {
            DefaultDirectory::Temp => std::env::temp_dir().join(TEMP_SUBDIR),
            DefaultDirectory::ProjectTextures => self.project_root.join(PROJECT_TEXTURES_SUBDIR),
            DefaultDirectory::BaseImage => base
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.project_root.clone()),
        }
    }
}

/// Routes a saved file into the host. Failures are reported, never raised.
pub fn apply(
    path: &Path,
    target: ApplyTarget,
    surfaces: &mut dyn ImageSurfaces,
) -> ApplyOutcome {
    let result = match target {
        ApplyTarget::None => return ApplyOutcome::Skipped,
        ApplyTarget::ImageEditor => surfaces.show_in_image_editor(path),
        ApplyTarget::Material => surfaces.assign_material_texture(path),
        ApplyTarget::Compositor => surfaces.insert_compositor_node(path),
    };
    match result {
        Ok(()) => ApplyOutcome::Applied(target),
        Err(err) => {
            let reason = format!("{err:#}");
            tracing::warn!(?target, path = %path.display(), %reason, "apply step failed");
            ApplyOutcome::Failed(reason)
        }
    }
}

/// Keeps `[A-Za-z0-9._-]`; everything else becomes `_`.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        DEFAULT_OUTPUT_FILE_NAME.to_string()
    } else {
        cleaned
    }
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|err| EditError::io(dir, err))
}

pub fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
    {
        ensure_dir(parent)?;
    }
    std::fs::write(path, bytes).map_err(|err| EditError::io(path, err))
}

/// `<stem>_NN.<ext>` with NN one past the highest index already in `dir`.
pub fn next_versioned_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let prefix = format!("{stem}_");
    let suffix = dotted(ext);
    let highest = std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter_map(|name| {
            let index = name.strip_prefix(&prefix)?.strip_suffix(&suffix)?;
            if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            index.parse::<u32>().ok()
        })
        .max()
        .unwrap_or(0);
    dir.join(format!("{stem}_{:02}{suffix}", highest.saturating_add(1)))
}

pub fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let token = uuid::Uuid::new_v4().simple().to_string();
    let token = &token[..UNIQUE_TOKEN_LEN];
    dir.join(format!("{stem}_{token}{}", dotted(ext)))
}

fn is_dir_like(path: &Path) -> bool {
    let raw = path.to_string_lossy();
    raw.ends_with('/')
        || raw.ends_with(MAIN_SEPARATOR)
        || path.is_dir()
        || path.extension().is_none()
}

fn split_name(path: &Path) -> (String, String) {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("nb_out")
        .to_string();
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_string();
    (stem, ext)
}

fn dotted(ext: &str) -> String {
    if ext.is_empty() {
        String::new()
    } else {
        format!(".{ext}")
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use nanobanana_contracts::host::{ImageSurfaces, NoSurfaces};
    use nanobanana_contracts::session::{
        ApplyTarget, CollisionPolicy, DefaultDirectory, SessionState,
    };

    use super::*;

    #[derive(Default)]
    struct RecordingSurfaces {
        shown: Vec<PathBuf>,
    }

    impl ImageSurfaces for RecordingSurfaces {
        fn show_in_image_editor(&mut self, path: &Path) -> anyhow::Result<()> {
            self.shown.push(path.to_path_buf());
            Ok(())
        }

        fn assign_material_texture(&mut self, _path: &Path) -> anyhow::Result<()> {
            anyhow::bail!("no active object")
        }

        fn insert_compositor_node(&mut self, _path: &Path) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn session(project: &Path) -> SessionState {
        SessionState {
            project_dir: Some(project.to_path_buf()),
            ..SessionState::default()
        }
    }

    #[test]
    fn versioned_path_follows_highest_index() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        fs::write(temp.path().join("nb_out_01.png"), b"1")?;
        fs::write(temp.path().join("nb_out_03.png"), b"3")?;
        fs::write(temp.path().join("nb_out_x9.png"), b"?")?;
        fs::write(temp.path().join("other_07.png"), b"7")?;

        assert_eq!(
            next_versioned_path(temp.path(), "nb_out", "png"),
            temp.path().join("nb_out_04.png")
        );
        assert_eq!(
            next_versioned_path(&temp.path().join("empty"), "nb_out", "png"),
            temp.path().join("empty").join("nb_out_01.png")
        );
        Ok(())
    }

    #[test]
    fn ensure_dir_is_idempotent() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let dir = temp.path().join("a").join("b");
        ensure_dir(&dir)?;
        ensure_dir(&dir)?;
        assert!(dir.is_dir());
        Ok(())
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(
            sanitize_file_name("my render (v2).png"),
            "my_render__v2_.png"
        );
        assert_eq!(sanitize_file_name("ok-name_1.jpg"), "ok-name_1.jpg");
        assert_eq!(sanitize_file_name("  "), DEFAULT_OUTPUT_FILE_NAME);
        assert_eq!(sanitize_file_name(".."), DEFAULT_OUTPUT_FILE_NAME);
    }

    #[test]
    fn resolve_prefers_explicit_then_default_dir_then_base_dir() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let base = temp.path().join("renders").join("frame.png");

        let mut state = session(temp.path());
        assert_eq!(
            OutputManager::from_session(&state).resolve(&base),
            temp.path().join("renders").join(DEFAULT_OUTPUT_FILE_NAME)
        );

        state.output.default_dir = DefaultDirectory::ProjectTextures;
        assert_eq!(
            OutputManager::from_session(&state).resolve(&base),
            temp.path().join("textures").join(DEFAULT_OUTPUT_FILE_NAME)
        );

        state.output_path = "//results/".to_string();
        assert_eq!(
            OutputManager::from_session(&state).resolve(&base),
            temp.path().join("results").join(DEFAULT_OUTPUT_FILE_NAME)
        );

        state.output_path = "//results/final shot.png".to_string();
        assert_eq!(
            OutputManager::from_session(&state).resolve(&base),
            temp.path().join("results").join("final_shot.png")
        );
        Ok(())
    }

    #[test]
    fn collision_policies_pick_distinct_paths() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let target = temp.path().join("out").join("nb_out.png");
        let mut state = session(temp.path());

        let overwrite = OutputManager::from_session(&state);
        assert_eq!(overwrite.save(b"one", &target)?, target);
        assert_eq!(overwrite.save(b"two", &target)?, target);
        assert_eq!(fs::read(&target)?, b"two");

        state.output.collision = CollisionPolicy::UniqueSuffix;
        let unique = OutputManager::from_session(&state).save(b"three", &target)?;
        assert_ne!(unique, target);
        let name = unique
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        assert!(name.starts_with("nb_out_") && name.ends_with(".png"));
        assert_eq!(name.len(), "nb_out_".len() + 8 + ".png".len());

        state.output.collision = CollisionPolicy::Versioned;
        let versioned = OutputManager::from_session(&state);
        assert_eq!(
            versioned.save(b"four", &target)?,
            temp.path().join("out").join("nb_out_01.png")
        );
        assert_eq!(
            versioned.save(b"five", &target)?,
            temp.path().join("out").join("nb_out_02.png")
        );
        Ok(())
    }

    #[test]
    fn save_into_unwritable_location_is_io_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, b"file")?;
        let manager = OutputManager::from_session(&session(temp.path()));
        let err = manager.save(b"x", &blocker.join("nb_out.png")).err();
        assert!(matches!(err, Some(crate::EditError::Io { .. })));
        Ok(())
    }

    #[test]
    fn apply_failures_are_returned_not_raised() {
        let path = Path::new("/tmp/nb_out.png");
        let mut surfaces = RecordingSurfaces::default();

        assert_eq!(
            apply(path, ApplyTarget::None, &mut surfaces),
            ApplyOutcome::Skipped
        );
        assert_eq!(
            apply(path, ApplyTarget::ImageEditor, &mut surfaces),
            ApplyOutcome::Applied(ApplyTarget::ImageEditor)
        );
        assert_eq!(surfaces.shown, vec![path.to_path_buf()]);
        assert!(matches!(
            apply(path, ApplyTarget::Material, &mut surfaces),
            ApplyOutcome::Failed(reason) if reason.contains("no active object")
        ));
        assert!(matches!(
            apply(path, ApplyTarget::Compositor, &mut NoSurfaces),
            ApplyOutcome::Failed(_)
        ));
    }
}
