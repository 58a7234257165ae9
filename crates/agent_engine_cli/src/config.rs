use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use agent_engine::QueryOptions;

use crate::error::CliEngineError;

/// Stable engine identifier used for explicit startup selection.
pub const CLI_ENGINE_ID: &str = "cli";
pub const DEFAULT_AGENT_EXECUTABLE: &str = "claude";

const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STDERR_TAIL_LINES: usize = 20;

/// Process configuration for the CLI engine.
#[derive(Debug, Clone)]
pub struct CliEngineConfig {
    /// Executable name looked up on `PATH`, or an explicit path.
    pub executable: PathBuf,
    /// Arguments appended after the protocol flags.
    pub extra_args: Vec<String>,
    /// Environment applied to every spawned process, below the per-query overlay.
    pub env: BTreeMap<String, String>,
    /// How long a control request waits for its response.
    pub control_timeout: Duration,
    /// Number of stderr lines kept for exit diagnostics.
    pub stderr_tail_lines: usize,
}

impl Default for CliEngineConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from(DEFAULT_AGENT_EXECUTABLE),
            extra_args: Vec::new(),
            env: BTreeMap::new(),
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            stderr_tail_lines: DEFAULT_STDERR_TAIL_LINES,
        }
    }
}

impl CliEngineConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }

    pub fn with_extra_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.extra_args.extend(args);
        self
    }

    pub fn insert_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }

    /// Resolves the executable against `PATH`.
    pub fn resolve_executable(&self) -> Result<PathBuf, CliEngineError> {
        which::which(&self.executable).map_err(|error| CliEngineError::ExecutableNotFound {
            executable: self.executable.display().to_string(),
            message: error.to_string(),
        })
    }

    pub(crate) fn command_args(&self, options: &QueryOptions) -> Vec<String> {
        let mut args: Vec<String> = [
            "--output-format",
            "stream-json",
            "--input-format",
            "stream-json",
            "--verbose",
            "--permission-prompt-tool",
            "stdio",
            "--permission-mode",
            options.permission_mode.as_str(),
        ]
        .into_iter()
        .map(str::to_string)
        .collect();

        if let Some(model) = options.model.as_deref().filter(|model| !model.is_empty()) {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        if let Some(resume) = options.resume.as_deref().filter(|token| !token.is_empty()) {
            args.push("--resume".to_string());
            args.push(resume.to_string());
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[cfg(test)]
mod tests {
    use agent_engine::PermissionMode;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn args_carry_protocol_flags_and_query_options() {
        let config = CliEngineConfig::new("claude").with_extra_args(["--debug".to_string()]);
        let options = QueryOptions::new("/work")
            .with_permission_mode(PermissionMode::Plan)
            .with_model(Some("opus".to_string()))
            .with_resume(Some("abc-123".to_string()));

        let args = config.command_args(&options);

        assert_eq!(
            args,
            vec![
                "--output-format",
                "stream-json",
                "--input-format",
                "stream-json",
                "--verbose",
                "--permission-prompt-tool",
                "stdio",
                "--permission-mode",
                "plan",
                "--model",
                "opus",
                "--resume",
                "abc-123",
                "--debug",
            ]
        );
    }

    #[test]
    fn empty_model_and_resume_are_omitted() {
        let options = QueryOptions::new("/work")
            .with_model(Some(String::new()))
            .with_resume(Some(String::new()));

        let args = CliEngineConfig::default().command_args(&options);

        assert!(!args.contains(&"--model".to_string()));
        assert!(!args.contains(&"--resume".to_string()));
    }

    #[test]
    fn unknown_executable_fails_resolution() {
        let config = CliEngineConfig::new("definitely-not-an-agent-binary-7f3a");

        let error = config.resolve_executable().expect_err("binary must not resolve");
        assert!(matches!(error, CliEngineError::ExecutableNotFound { .. }));
    }
}
