use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;

use crate::catalog::{OrphanPolicy, StimulusDirs, Variant};
use crate::table::Backend;

/// Application configuration loaded from TOML config file.
/// All fields have defaults; the config file is optional.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    /// Which experiment to run.
    pub variant: Variant,
    /// A_/B_ stimuli (paired) or the tones (single).
    pub single_dir: PathBuf,
    /// AB_ stimuli (paired only).
    pub chord_dir: PathBuf,
    /// Results table location (overrides XDG default).
    pub results_path: Option<PathBuf>,
    /// Results storage backend.
    pub backend: Backend,
    /// Entering this instead of a participant ID opens the admin shell.
    /// Admin access is disabled when unset.
    pub admin_pin: Option<String>,
    /// Report A/B/AB files that have no partner.
    pub orphans: OrphanPolicy,
    /// Player command line; stimulus bytes are written to its stdin.
    pub player: Vec<String>,
    /// Fixed shuffle seed, for pilot runs.
    pub seed: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            variant: Variant::default(),
            single_dir: PathBuf::from("sounds/single"),
            chord_dir: PathBuf::from("sounds/chord"),
            results_path: None,
            backend: Backend::default(),
            admin_pin: None,
            orphans: OrphanPolicy::default(),
            player: Vec::new(),
            seed: None,
        }
    }
}

impl AppConfig {
    /// Load config from `path`, or `~/.config/listening-lab/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load(path: Option<&Path>) -> Self {
        let config_path = path.map(Path::to_path_buf).or_else(Self::config_path);
        match config_path {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match Self::parse(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn stimulus_dirs(&self) -> StimulusDirs {
        StimulusDirs {
            single: self.single_dir.clone(),
            chord: self.chord_dir.clone(),
        }
    }

    /// Results path: config value, else the XDG data directory.
    pub fn resolve_results_path(&self) -> PathBuf {
        self.results_path
            .clone()
            .unwrap_or_else(|| default_results_path(self.backend))
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Resolve the default results path using XDG data directory.
pub fn default_results_path(backend: Backend) -> PathBuf {
    let file = match backend {
        Backend::Csv => "results.csv",
        Backend::Sqlite => "results.db",
    };
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.join(file)
    } else {
        // Fallback: current directory
        PathBuf::from(file)
    }
}
