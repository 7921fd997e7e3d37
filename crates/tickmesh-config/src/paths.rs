//! Configuration file locations.
//!
//! Files are merged lowest precedence first: the user file, then the
//! project's `tickmesh.toml`, then its uncommitted `tickmesh.local.toml`.

use crate::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// One file layer of the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigLayer {
    /// `~/.config/tickmesh/config.toml` or the platform equivalent.
    User,
    /// `tickmesh.toml` in the project directory.
    Project,
    /// `tickmesh.local.toml` in the project directory.
    Local,
}

impl ConfigLayer {
    /// Every layer in merge order.
    pub const ALL: [ConfigLayer; 3] = [Self::User, Self::Project, Self::Local];

    pub fn file_name(self) -> &'static str {
        match self {
            Self::User => "config.toml",
            Self::Project => "tickmesh.toml",
            Self::Local => "tickmesh.local.toml",
        }
    }
}

/// Resolves configuration files for one project.
#[derive(Debug, Clone)]
pub struct Paths {
    user_dir: Option<PathBuf>,
    project_dir: PathBuf,
}

impl Paths {
    /// Paths for `project_dir`, with the platform user directory.
    pub fn for_project(project_dir: impl AsRef<Path>) -> Self {
        Self {
            user_dir: ProjectDirs::from("dev", "tickmesh", "tickmesh")
                .map(|dirs| dirs.config_dir().to_path_buf()),
            project_dir: project_dir.as_ref().to_path_buf(),
        }
    }

    /// Replaces the user directory.
    pub fn with_user_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.user_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Ignores the user layer entirely.
    pub fn without_user_dir(mut self) -> Self {
        self.user_dir = None;
        self
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn user_config_dir(&self) -> Result<&Path, ConfigError> {
        self.user_dir.as_deref().ok_or_else(|| {
            ConfigError::XdgError("Failed to determine user config directory".to_string())
        })
    }

    /// Where `layer` would be read from. `None` for the user layer when no
    /// user directory is known.
    pub fn file(&self, layer: ConfigLayer) -> Option<PathBuf> {
        match layer {
            ConfigLayer::User => self
                .user_dir
                .as_ref()
                .map(|dir| dir.join(layer.file_name())),
            ConfigLayer::Project | ConfigLayer::Local => {
                Some(self.project_dir.join(layer.file_name()))
            }
        }
    }

    /// Layer files that exist on disk, in merge order.
    pub fn existing_files(&self) -> Vec<(ConfigLayer, PathBuf)> {
        ConfigLayer::ALL
            .into_iter()
            .filter_map(|layer| self.file(layer).map(|path| (layer, path)))
            .filter(|(_, path)| path.is_file())
            .collect()
    }
}
