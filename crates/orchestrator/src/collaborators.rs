//! Request/response collaborators the orchestrator calls through traits:
//! credentials, auxiliary assets, file search and transcript history.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;
use tracing::debug;
use transcript_store::{list_transcripts, HistoricalEvent, TranscriptLog, TranscriptStoreError};

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("credential store error: {0}")]
    Credentials(String),

    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    History(#[from] TranscriptStoreError),

    #[error("background task failed: {0}")]
    Task(String),
}

impl CollaboratorError {
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}

/// The active credential/provider profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderProfile {
    pub name: String,
    /// Environment overlay applied to every new execution; never sent to
    /// the UI.
    #[serde(skip)]
    pub env: BTreeMap<String, String>,
}

impl ProviderProfile {
    #[must_use]
    pub fn new(name: impl Into<String>, env: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            env,
        }
    }

    #[must_use]
    pub fn env_keys(&self) -> Vec<&str> {
        self.env.keys().map(String::as_str).collect()
    }
}

pub trait CredentialStore: Send + Sync {
    fn active_provider(&self) -> Result<ProviderProfile, CollaboratorError>;

    /// Receiver whose value changes every time the active provider does.
    fn subscribe_changes(&self) -> watch::Receiver<u64>;
}

/// In-memory credential store; `set_active` notifies subscribers.
pub struct StaticCredentialStore {
    active: Mutex<ProviderProfile>,
    changes: watch::Sender<u64>,
}

impl StaticCredentialStore {
    #[must_use]
    pub fn new(profile: ProviderProfile) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            active: Mutex::new(profile),
            changes,
        }
    }

    pub fn set_active(&self, profile: ProviderProfile) {
        *lock_unpoisoned(&self.active) = profile;
        self.changes.send_modify(|version| *version += 1);
    }
}

impl CredentialStore for StaticCredentialStore {
    fn active_provider(&self) -> Result<ProviderProfile, CollaboratorError> {
        Ok(lock_unpoisoned(&self.active).clone())
    }

    fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssetKind {
    Agents,
    Skills,
    Commands,
    OutputStyles,
}

impl AssetKind {
    #[must_use]
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Agents => "agents",
            Self::Skills => "skills",
            Self::Commands => "commands",
            Self::OutputStyles => "output-styles",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetEntry {
    pub name: String,
    pub kind: AssetKind,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[async_trait]
pub trait AssetCatalog: Send + Sync {
    async fn list_assets(&self, kind: AssetKind) -> Result<Vec<AssetEntry>, CollaboratorError>;
}

/// Markdown assets under `<root>/<kind>/`. Skills are directories holding a
/// `SKILL.md`; other kinds are `*.md` files.
#[derive(Debug, Clone)]
pub struct DirectoryAssetCatalog {
    root: PathBuf,
}

impl DirectoryAssetCatalog {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn scan(&self, kind: AssetKind) -> Result<Vec<AssetEntry>, CollaboratorError> {
        let dir = self.root.join(kind.dir_name());
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&dir)
            .map_err(|source| CollaboratorError::io("listing assets", &dir, source))?;

        let mut assets = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|source| CollaboratorError::io("listing assets", &dir, source))?;
            let path = entry.path();
            let file = match kind {
                AssetKind::Skills if path.is_dir() => path.join("SKILL.md"),
                AssetKind::Skills => continue,
                _ if path.extension().and_then(|ext| ext.to_str()) == Some("md") => path.clone(),
                _ => continue,
            };
            if !file.is_file() {
                continue;
            }
            let Some(name) = path.file_stem().map(|stem| stem.to_string_lossy().into_owned())
            else {
                continue;
            };
            let text = fs::read_to_string(&file)
                .map_err(|source| CollaboratorError::io("reading asset", &file, source))?;
            assets.push(AssetEntry {
                name,
                kind,
                description: frontmatter_description(&text, &file),
                path: file,
            });
        }

        assets.sort_by(|left, right| left.name.cmp(&right.name));
        Ok(assets)
    }
}

#[async_trait]
impl AssetCatalog for DirectoryAssetCatalog {
    async fn list_assets(&self, kind: AssetKind) -> Result<Vec<AssetEntry>, CollaboratorError> {
        let catalog = self.clone();
        tokio::task::spawn_blocking(move || catalog.scan(kind))
            .await
            .map_err(|error| CollaboratorError::Task(error.to_string()))?
    }
}

#[derive(Debug, Default, Deserialize)]
struct Frontmatter {
    #[serde(default)]
    description: Option<String>,
}

/// Text between a leading `---` fence and the next `---` line.
fn frontmatter_block(text: &str) -> Option<String> {
    let mut lines = text.lines();
    if lines.next()?.trim_end() != "---" {
        return None;
    }
    let mut block = Vec::new();
    for line in lines {
        if line.trim_end() == "---" {
            return Some(block.join("\n"));
        }
        block.push(line);
    }
    None
}

/// `description` from the YAML frontmatter, if any.
fn frontmatter_description(text: &str, path: &Path) -> Option<String> {
    let block = frontmatter_block(text)?;
    let frontmatter = match serde_yaml::from_str::<Frontmatter>(&block) {
        Ok(frontmatter) => frontmatter,
        Err(error) => {
            debug!(path = %path.display(), %error, "ignoring unreadable frontmatter");
            return None;
        }
    };
    frontmatter
        .description
        .map(|description| description.trim().to_string())
        .filter(|description| !description.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileMatch {
    /// Path relative to the search root, `/`-separated.
    pub path: String,
    /// Lower is better.
    pub score: usize,
}

#[async_trait]
pub trait FileSearch: Send + Sync {
    async fn search(
        &self,
        root: &Path,
        query: &str,
        limit: usize,
    ) -> Result<Vec<FileMatch>, CollaboratorError>;
}

/// Case-insensitive substring search over files under a root, honoring
/// ignore files.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalkFileSearch;

const FILE_NAME_MISS_PENALTY: usize = 1_000;

fn walk(root: &Path, query: &str, limit: usize) -> Vec<FileMatch> {
    let needle = query.to_lowercase();
    let mut matches = Vec::new();

    for entry in WalkBuilder::new(root).build().flatten() {
        if !entry.file_type().is_some_and(|file_type| file_type.is_file()) {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let path = relative.to_string_lossy().replace('\\', "/");
        let lowered = path.to_lowercase();
        if !lowered.contains(&needle) {
            continue;
        }
        let file_name = lowered.rsplit('/').next().unwrap_or_default();
        let penalty = if file_name.contains(&needle) {
            0
        } else {
            FILE_NAME_MISS_PENALTY
        };
        matches.push(FileMatch {
            score: penalty + path.len(),
            path,
        });
    }

    matches.sort_by(|left, right| {
        left.score
            .cmp(&right.score)
            .then_with(|| left.path.cmp(&right.path))
    });
    matches.truncate(limit);
    matches
}

#[async_trait]
impl FileSearch for WalkFileSearch {
    async fn search(
        &self,
        root: &Path,
        query: &str,
        limit: usize,
    ) -> Result<Vec<FileMatch>, CollaboratorError> {
        if !root.is_dir() {
            return Err(CollaboratorError::io(
                "searching files",
                root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
            ));
        }
        let root = root.to_path_buf();
        let query = query.to_string();
        tokio::task::spawn_blocking(move || walk(&root, &query, limit))
            .await
            .map_err(|error| CollaboratorError::Task(error.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub session_id: String,
    pub project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// RFC3339 modification time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
}

pub trait SessionHistory: Send + Sync {
    fn list(&self) -> Result<Vec<HistoryEntry>, CollaboratorError>;

    fn load(&self, session_id: &str) -> Result<Vec<HistoricalEvent>, CollaboratorError>;
}

/// History backed by the engine's `projects/*/<session>.jsonl` logs.
#[derive(Debug, Clone)]
pub struct ProjectsHistory {
    home: PathBuf,
}

impl ProjectsHistory {
    #[must_use]
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }
}

impl SessionHistory for ProjectsHistory {
    fn list(&self) -> Result<Vec<HistoryEntry>, CollaboratorError> {
        Ok(list_transcripts(&self.home)?
            .into_iter()
            .map(|summary| HistoryEntry {
                session_id: summary.session_id,
                project: summary.project,
                title: summary.title,
                modified: summary
                    .modified
                    .and_then(|modified| modified.format(&Rfc3339).ok()),
            })
            .collect())
    }

    fn load(&self, session_id: &str) -> Result<Vec<HistoricalEvent>, CollaboratorError> {
        Ok(TranscriptLog::find(&self.home, session_id)?.into_events())
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
