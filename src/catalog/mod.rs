pub mod filename;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use walkdir::WalkDir;

use crate::gate::Phase;
use filename::Part;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Stimulus directory not found: {0}")]
    DirectoryNotFound(PathBuf),
    #[error("No stimuli found in {dir}")]
    EmptyCatalog { dir: PathBuf },
    #[error("No complete A/B/AB pairs formed from {single_dir} and {chord_dir}")]
    NoPairsFormed {
        single_dir: PathBuf,
        chord_dir: PathBuf,
    },
    #[error("IO error listing {dir}: {source}")]
    Io {
        dir: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

impl CatalogError {
    /// Operator-facing hint for fixing the stimulus layout.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::DirectoryNotFound(_) => "Check single_dir / chord_dir in the config file.",
            Self::EmptyCatalog { .. } => "The directory must contain .wav files.",
            Self::NoPairsFormed { .. } => {
                "Name files A_<key>.wav and B_<key>.wav in single_dir, AB_<key>.wav in chord_dir; <key> must match across all three."
            }
            Self::Io { .. } => "Check the directory permissions.",
        }
    }
}

/// Experiment variant: how stimuli are packaged into trials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// One tone per trial, rated once.
    Single,
    /// A and B rated together, then AB rated.
    #[default]
    Paired,
}

/// What to do with A/B/AB files whose key is missing from another partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    #[default]
    Silent,
    Warn,
}

/// A single audio asset. Identity is `(directory, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StimulusFile {
    pub directory: PathBuf,
    pub name: String,
}

impl StimulusFile {
    pub fn new(directory: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            name: name.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.name)
    }
}

/// One unit of evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trial {
    Single {
        id: usize,
        file: StimulusFile,
    },
    Paired {
        pair_id: String,
        a: StimulusFile,
        b: StimulusFile,
        ab: StimulusFile,
    },
}

impl Trial {
    /// Phases of this trial, in the order they must be completed.
    pub fn phases(&self) -> &'static [Phase] {
        match self {
            Self::Single { .. } => &[Phase::Single],
            Self::Paired { .. } => &[Phase::Single, Phase::Chord],
        }
    }

    /// Stimuli presented during `phase`, in playback order.
    pub fn stimuli(&self, phase: Phase) -> Vec<&StimulusFile> {
        match (self, phase) {
            (Self::Single { file, .. }, Phase::Single) => vec![file],
            (Self::Paired { a, b, .. }, Phase::Single) => vec![a, b],
            (Self::Paired { ab, .. }, Phase::Chord) => vec![ab],
            (Self::Single { .. }, Phase::Chord) => Vec::new(),
        }
    }

    /// Short label for logs and the participant view.
    pub fn label(&self) -> String {
        match self {
            Self::Single { id, file } => format!("#{id} {}", file.name),
            Self::Paired { pair_id, .. } => pair_id.clone(),
        }
    }
}

/// Non-empty set of trials, in discovery (lexicographic) order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialSet {
    trials: Vec<Trial>,
}

impl TrialSet {
    /// Returns `None` for an empty list.
    pub fn new(trials: Vec<Trial>) -> Option<Self> {
        if trials.is_empty() {
            None
        } else {
            Some(Self { trials })
        }
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Trial> {
        self.trials.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trial> {
        self.trials.iter()
    }
}

/// The two configured stimulus directories.
#[derive(Debug, Clone)]
pub struct StimulusDirs {
    pub single: PathBuf,
    pub chord: PathBuf,
}

/// Result of discovery: the trial set plus files that could not be paired.
#[derive(Debug)]
pub struct Catalog {
    pub trials: TrialSet,
    pub orphans: Vec<StimulusFile>,
}

/// Source of stimulus files and their bytes.
pub trait StimulusStore: Send + Sync {
    /// File names directly inside `dir` (non-recursive).
    fn list_files(&self, dir: &Path) -> Result<Vec<String>, CatalogError>;

    /// Full contents of a file, or `None` if it can't be read.
    fn read_bytes(&self, path: &Path) -> Option<Vec<u8>>;
}

/// Stimulus store backed by the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsStimulusStore;

impl StimulusStore for FsStimulusStore {
    fn list_files(&self, dir: &Path) -> Result<Vec<String>, CatalogError> {
        if !dir.is_dir() {
            return Err(CatalogError::DirectoryNotFound(dir.to_path_buf()));
        }

        let mut names = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(true) {
            let entry = entry.map_err(|source| CatalogError::Io {
                dir: dir.to_path_buf(),
                source,
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            } else {
                log::debug!("Skipping non-UTF-8 file name in {}", dir.display());
            }
        }
        Ok(names)
    }

    fn read_bytes(&self, path: &Path) -> Option<Vec<u8>> {
        match std::fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::debug!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }
}

/// List audio files in `dir`, sorted lexicographically.
fn list_audio(store: &dyn StimulusStore, dir: &Path) -> Result<Vec<String>, CatalogError> {
    let mut names: Vec<String> = store
        .list_files(dir)?
        .into_iter()
        .filter(|n| filename::is_audio_file(n))
        .collect();
    names.sort();
    Ok(names)
}

/// Discover stimuli and build the trial set for `variant`.
pub fn discover(
    store: &dyn StimulusStore,
    variant: Variant,
    dirs: &StimulusDirs,
    orphans: OrphanPolicy,
) -> Result<Catalog, CatalogError> {
    let catalog = match variant {
        Variant::Single => discover_single(store, &dirs.single)?,
        Variant::Paired => discover_paired(store, dirs)?,
    };

    for file in &catalog.orphans {
        match orphans {
            OrphanPolicy::Warn => {
                log::warn!("Orphaned stimulus (no matching pair): {}", file.path().display())
            }
            OrphanPolicy::Silent => {
                log::debug!("Dropping unpaired stimulus {}", file.path().display())
            }
        }
    }

    log::info!(
        "Discovered {} trials ({} orphaned files)",
        catalog.trials.len(),
        catalog.orphans.len()
    );
    Ok(catalog)
}

fn discover_single(store: &dyn StimulusStore, dir: &Path) -> Result<Catalog, CatalogError> {
    let trials = list_audio(store, dir)?
        .into_iter()
        .enumerate()
        .map(|(id, name)| Trial::Single {
            id,
            file: StimulusFile::new(dir, name),
        })
        .collect();

    let trials = TrialSet::new(trials).ok_or_else(|| CatalogError::EmptyCatalog {
        dir: dir.to_path_buf(),
    })?;
    Ok(Catalog {
        trials,
        orphans: Vec::new(),
    })
}

fn discover_paired(store: &dyn StimulusStore, dirs: &StimulusDirs) -> Result<Catalog, CatalogError> {
    // key -> file, per part
    let mut parts: BTreeMap<Part, BTreeMap<String, StimulusFile>> = BTreeMap::new();

    let sources = [
        (&dirs.single, &[Part::A, Part::B][..]),
        (&dirs.chord, &[Part::Ab][..]),
    ];
    for (dir, wanted) in sources {
        for name in list_audio(store, dir)? {
            match filename::classify(&name) {
                Some((part, key)) if wanted.contains(&part) => {
                    let key = key.to_string();
                    parts
                        .entry(part)
                        .or_default()
                        .insert(key, StimulusFile::new(dir.as_path(), name));
                }
                _ => log::debug!("Ignoring {} in {}", name, dir.display()),
            }
        }
    }

    let a = parts.remove(&Part::A).unwrap_or_default();
    let mut b = parts.remove(&Part::B).unwrap_or_default();
    let mut ab = parts.remove(&Part::Ab).unwrap_or_default();

    let mut trials = Vec::new();
    let mut orphans = Vec::new();
    for (key, a_file) in a {
        if b.contains_key(&key) && ab.contains_key(&key) {
            if let (Some(b_file), Some(ab_file)) = (b.remove(&key), ab.remove(&key)) {
                trials.push(Trial::Paired {
                    pair_id: key,
                    a: a_file,
                    b: b_file,
                    ab: ab_file,
                });
            }
        } else {
            orphans.push(a_file);
        }
    }
    orphans.extend(b.into_values());
    orphans.extend(ab.into_values());
    orphans.sort();

    let trials = TrialSet::new(trials).ok_or_else(|| CatalogError::NoPairsFormed {
        single_dir: dirs.single.clone(),
        chord_dir: dirs.chord.clone(),
    })?;
    Ok(Catalog { trials, orphans })
}
