mod error;
mod paths;
mod schema;
mod store;

pub use error::TranscriptStoreError;
pub use paths::{encode_project_path, project_dir, transcript_path, PROJECTS_DIR};
pub use schema::{HistoricalEvent, LogRecord};
pub use store::{list_transcripts, TranscriptLog, TranscriptSummary};
