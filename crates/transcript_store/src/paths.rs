use std::path::{Path, PathBuf};

pub const PROJECTS_DIR: &str = "projects";

/// Directory name the engine uses for a project: the absolute path with
/// separators flattened to `-`.
#[must_use]
pub fn encode_project_path(cwd: &Path) -> String {
    let normalized = cwd.to_string_lossy().replace('\\', "/");
    match normalized.strip_prefix('/') {
        Some(rest) => format!("-{}", rest.replace('/', "-")),
        None => normalized.replace('/', "-"),
    }
}

#[must_use]
pub fn project_dir(home: &Path, cwd: &Path) -> PathBuf {
    home.join(PROJECTS_DIR).join(encode_project_path(cwd))
}

#[must_use]
pub fn transcript_path(home: &Path, cwd: &Path, session_id: &str) -> PathBuf {
    project_dir(home, cwd).join(format!("{session_id}.jsonl"))
}
