use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use agent_engine::{ContentBlock, MessageBody};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use transcript::Transcript;

use crate::error::TranscriptStoreError;
use crate::paths::PROJECTS_DIR;
use crate::schema::{HistoricalEvent, LogRecord};

/// A parsed transcript log.
#[derive(Debug, Clone)]
pub struct TranscriptLog {
    path: PathBuf,
    session_id: Option<String>,
    summary: Option<String>,
    cwd: Option<String>,
    events: Vec<HistoricalEvent>,
    skipped: usize,
}

impl TranscriptLog {
    /// Reads and validates every line of the log at `path`.
    ///
    /// Blank lines are ignored. Sidechain and meta lines, and record types
    /// other than `user`, `assistant` and `summary`, are counted as skipped.
    pub fn open(path: &Path) -> Result<Self, TranscriptStoreError> {
        let path = path.to_path_buf();
        let file = File::open(&path)
            .map_err(|source| TranscriptStoreError::io("opening transcript", &path, source))?;
        let reader = BufReader::new(file);

        let mut log = Self {
            path: path.clone(),
            session_id: None,
            summary: None,
            cwd: None,
            events: Vec::new(),
            skipped: 0,
        };

        for (line_index, line_result) in reader.lines().enumerate() {
            let line_number = line_index + 1;
            let line = line_result
                .map_err(|source| TranscriptStoreError::io_line(&path, line_number, source))?;
            if line.trim().is_empty() {
                continue;
            }

            let record = serde_json::from_str::<LogRecord>(&line)
                .map_err(|source| TranscriptStoreError::json_line(&path, line_number, source))?;
            if let Some(timestamp) = &record.timestamp {
                validate_rfc3339(&path, line_number, "timestamp", timestamp)?;
            }
            log.accept(line_number, record)?;
        }

        if log.session_id.is_none() {
            log.session_id = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned());
        }
        Ok(log)
    }

    /// Locates `<session_id>.jsonl` under any project directory of `home`.
    pub fn find(home: &Path, session_id: &str) -> Result<Self, TranscriptStoreError> {
        let file_name = format!("{session_id}.jsonl");
        for project in project_dirs(home)? {
            let candidate = project.join(&file_name);
            if candidate.is_file() {
                return Self::open(&candidate);
            }
        }
        Err(TranscriptStoreError::TranscriptNotFound {
            root: home.join(PROJECTS_DIR),
            session_id: session_id.to_string(),
        })
    }

    fn accept(
        &mut self,
        line_number: usize,
        record: LogRecord,
    ) -> Result<(), TranscriptStoreError> {
        if record.kind == "summary" {
            if self.summary.is_none() {
                self.summary = record.summary;
            }
            return Ok(());
        }
        if !record.is_conversation() {
            self.skipped += 1;
            return Ok(());
        }

        if self.session_id.is_none() {
            self.session_id = record.session_id.clone();
        }
        if self.cwd.is_none() {
            self.cwd = record.cwd.clone();
        }

        let Some(message) = record.message.clone() else {
            return Err(TranscriptStoreError::MissingMessage {
                path: self.path.clone(),
                line: line_number,
                kind: record.kind,
            });
        };
        self.events.push(HistoricalEvent::from_record(record, message));
        Ok(())
    }

    /// Replays the log through reconciliation, stamping each appended
    /// message with its line's timestamp.
    #[must_use]
    pub fn to_transcript(&self) -> Transcript {
        let mut transcript = Transcript::new();
        for historical in &self.events {
            let outcome = transcript
                .apply_historical_event(&historical.event, historical.tool_use_result.as_ref());
            let timestamp = historical
                .timestamp
                .as_deref()
                .and_then(|value| OffsetDateTime::parse(value, &Rfc3339).ok());
            if let (Some(index), Some(timestamp)) = (outcome.appended, timestamp) {
                if let Some(message) = transcript.message_mut(index) {
                    message.timestamp = timestamp;
                }
            }
        }
        transcript
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    #[must_use]
    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    #[must_use]
    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    #[must_use]
    pub fn events(&self) -> &[HistoricalEvent] {
        &self.events
    }

    #[must_use]
    pub fn into_events(self) -> Vec<HistoricalEvent> {
        self.events
    }

    /// Lines that were valid but not part of the main conversation.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

/// One entry of a history listing.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSummary {
    pub session_id: String,
    pub path: PathBuf,
    /// Encoded project directory name.
    pub project: String,
    /// Log summary line, or the first user prompt.
    pub title: Option<String>,
    pub modified: Option<OffsetDateTime>,
}

/// Lists every transcript under `<home>/projects/*/`, most recent first.
///
/// A missing projects directory yields an empty list. Titles are read
/// leniently: malformed lines are passed over rather than failing the
/// listing.
pub fn list_transcripts(home: &Path) -> Result<Vec<TranscriptSummary>, TranscriptStoreError> {
    let mut summaries = Vec::new();
    for project in project_dirs(home)? {
        let entries = fs::read_dir(&project)
            .map_err(|source| TranscriptStoreError::io("listing project", &project, source))?;
        for entry in entries {
            let entry = entry
                .map_err(|source| TranscriptStoreError::io("listing project", &project, source))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(session_id) = path.file_stem().map(|stem| stem.to_string_lossy().into_owned())
            else {
                continue;
            };
            let modified = entry
                .metadata()
                .and_then(|metadata| metadata.modified())
                .ok()
                .map(OffsetDateTime::from);
            summaries.push(TranscriptSummary {
                session_id,
                title: peek_title(&path),
                project: project
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                path,
                modified,
            });
        }
    }

    summaries.sort_by(|left, right| right.modified.cmp(&left.modified));
    Ok(summaries)
}

fn project_dirs(home: &Path) -> Result<Vec<PathBuf>, TranscriptStoreError> {
    let root = home.join(PROJECTS_DIR);
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(&root)
        .map_err(|source| TranscriptStoreError::io("listing projects", &root, source))?;

    let mut dirs = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|source| TranscriptStoreError::io("listing projects", &root, source))?;
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn peek_title(path: &Path) -> Option<String> {
    let reader = BufReader::new(File::open(path).ok()?);
    let mut first_prompt = None;
    for line in reader.lines().map_while(Result::ok) {
        let Ok(record) = serde_json::from_str::<LogRecord>(&line) else {
            continue;
        };
        if record.kind == "summary" {
            if let Some(summary) = record.summary {
                return Some(summary);
            }
        }
        if first_prompt.is_none() && record.kind == "user" && record.is_conversation() {
            first_prompt = record
                .message
                .as_ref()
                .and_then(|message| prompt_text(&message.content));
        }
    }
    first_prompt
}

fn prompt_text(body: &MessageBody) -> Option<String> {
    let text = match body {
        MessageBody::Text(text) => text.clone(),
        MessageBody::Blocks(blocks) => blocks
            .iter()
            .find_map(|block| match block {
                ContentBlock::Text { text } => Some(text.clone()),
                _ => None,
            })?,
    };
    let first_line = text.lines().next()?.trim();
    (!first_line.is_empty()).then(|| first_line.to_string())
}

fn validate_rfc3339(
    path: &Path,
    line_number: usize,
    field: &'static str,
    value: &str,
) -> Result<(), TranscriptStoreError> {
    if OffsetDateTime::parse(value, &Rfc3339).is_err() {
        return Err(TranscriptStoreError::InvalidTimestamp {
            path: path.to_path_buf(),
            line: line_number,
            field,
            value: value.to_string(),
        });
    }

    Ok(())
}
