use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Filesystem event backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchBackend {
    /// The platform-native backend (inotify, FSEvents, ReadDirectoryChangesW).
    #[default]
    Recommended,
    /// Portable polling backend; slower but works on network shares.
    Poll,
}

/// Watcher configuration, loaded once at service construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Extensions treated as interchangeable texture aliases.
    #[serde(default = "default_textures")]
    pub textures: HashSet<String>,

    /// Extensions whose rename triggers reference patching.
    #[serde(default = "default_tracked")]
    pub tracked: HashSet<String>,

    /// Expand texture renames to every texture alias of the same stem.
    #[serde(default = "default_true")]
    pub match_any_texture_extension: bool,

    /// Allow reference-key expansion beyond the exact original extension.
    #[serde(default = "default_true")]
    pub allow_ext_change: bool,

    /// React to directory renames.
    #[serde(default = "default_true")]
    pub allow_dir_change: bool,

    /// Log intended rewrites instead of touching disk or index.
    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub backend: WatchBackend,
}

fn default_true() -> bool {
    true
}

fn default_textures() -> HashSet<String> {
    [
        ".dds", ".tif", ".tiff", ".png", ".jpg", ".jpeg", ".tga", ".bmp", ".gif", ".hdr", ".exr",
        ".gfx",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

fn default_tracked() -> HashSet<String> {
    [
        ".dds", ".tif", ".png", ".jpg", ".jpeg", ".tga", ".bmp", ".gif", ".hdr", ".mtl", ".xml",
        ".lay", ".lyr", ".cdf", ".lua", ".cgf", ".chr", ".cga", ".skin", ".adb",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            textures: default_textures(),
            tracked: default_tracked(),
            match_any_texture_extension: true,
            allow_ext_change: true,
            allow_dir_change: true,
            dry_run: false,
            backend: WatchBackend::default(),
        }
    }
}

impl WatchConfig {
    /// Load config from a TOML file, falling back to defaults for absent keys.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&content)
            .map_err(|e| crate::error::Error::Config(e.to_string()))?;
        config.normalize();
        Ok(config)
    }

    /// Lowercase every extension and ensure the leading dot.
    ///
    /// Lookup keys everywhere in the index are lowercase, so the sets must be
    /// too, whatever the config file says.
    pub fn normalize(&mut self) {
        self.textures = Self::normalized_set(&self.textures);
        self.tracked = Self::normalized_set(&self.tracked);
    }

    fn normalized_set(set: &HashSet<String>) -> HashSet<String> {
        set.iter()
            .map(|ext| {
                let lower = ext.to_lowercase();
                if lower.starts_with('.') {
                    lower
                } else {
                    format!(".{lower}")
                }
            })
            .collect()
    }

    /// Whether `ext` (lowercase, with dot) is a texture alias.
    pub fn is_texture_ext(&self, ext: &str) -> bool {
        self.textures.contains(ext)
    }

    /// Whether `ext` (lowercase, with dot) is tracked for rename propagation.
    pub fn is_tracked_ext(&self, ext: &str) -> bool {
        self.tracked.contains(ext)
    }

    /// Whether `path` has a tracked extension.
    pub fn is_tracked_path(&self, path: &Path) -> bool {
        crate::ext_of(path).is_some_and(|ext| self.is_tracked_ext(&ext))
    }

    /// Whether `path` has a texture extension.
    pub fn is_texture_path(&self, path: &Path) -> bool {
        crate::ext_of(path).is_some_and(|ext| self.is_texture_ext(&ext))
    }
}
