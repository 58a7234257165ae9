//! Environment configuration.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

use agent_engine::PermissionMode;

use crate::error::BridgeError;

pub const ENGINE_VAR: &str = "SESSION_BRIDGE_ENGINE";
pub const AGENT_BIN_VAR: &str = "SESSION_BRIDGE_AGENT_BIN";
pub const CWD_VAR: &str = "SESSION_BRIDGE_CWD";
pub const MODEL_VAR: &str = "SESSION_BRIDGE_MODEL";
pub const PERMISSION_MODE_VAR: &str = "SESSION_BRIDGE_PERMISSION_MODE";
pub const DATA_ROOT_VAR: &str = "SESSION_BRIDGE_DATA_ROOT";
pub const PROVIDER_VAR: &str = "SESSION_BRIDGE_PROVIDER";
pub const PROVIDER_ENV_VAR: &str = "SESSION_BRIDGE_PROVIDER_ENV";
pub const LOG_VAR: &str = "SESSION_BRIDGE_LOG";
pub const MOCK_DELAY_VAR: &str = "SESSION_BRIDGE_MOCK_DELAY_MS";

pub const DEFAULT_PROVIDER_NAME: &str = "default";
const DATA_DIR_NAME: &str = ".claude";

/// Raw settings as read from the environment. Values are validated where
/// they are used so a bad variable names itself in the error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvConfig {
    pub engine: Option<String>,
    pub agent_bin: Option<String>,
    pub cwd: Option<PathBuf>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub data_root: Option<PathBuf>,
    pub provider: Option<String>,
    pub provider_env: Option<String>,
    pub log_filter: Option<String>,
    pub mock_delay_ms: Option<String>,
    pub home: Option<PathBuf>,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self {
            engine: env_string_opt(ENGINE_VAR),
            agent_bin: env_string_opt(AGENT_BIN_VAR),
            cwd: env_string_opt(CWD_VAR).map(PathBuf::from),
            model: env_string_opt(MODEL_VAR),
            permission_mode: env_string_opt(PERMISSION_MODE_VAR),
            data_root: env_string_opt(DATA_ROOT_VAR).map(PathBuf::from),
            provider: env_string_opt(PROVIDER_VAR),
            provider_env: env_string_opt(PROVIDER_ENV_VAR),
            log_filter: env_string_opt(LOG_VAR).or_else(|| env_string_opt("RUST_LOG")),
            mock_delay_ms: env_string_opt(MOCK_DELAY_VAR),
            home: env_string_opt("HOME").map(PathBuf::from),
        }
    }

    pub fn permission_mode(&self) -> Result<PermissionMode, BridgeError> {
        match &self.permission_mode {
            None => Ok(PermissionMode::Default),
            Some(value) => value.parse().map_err(|_| {
                BridgeError::invalid(PERMISSION_MODE_VAR, value, "unknown permission mode")
            }),
        }
    }

    /// Working directory for sessions that do not name one.
    pub fn cwd(&self) -> Result<PathBuf, BridgeError> {
        match &self.cwd {
            Some(cwd) if cwd.is_absolute() => Ok(cwd.clone()),
            Some(cwd) => Err(BridgeError::invalid(
                CWD_VAR,
                cwd.display().to_string(),
                "must be an absolute path",
            )),
            None => env::current_dir().map_err(BridgeError::Io),
        }
    }

    /// Root holding `agents/`, `skills/`, `commands/`, `output-styles/` and
    /// the `projects/` transcript logs.
    pub fn data_root(&self) -> Option<PathBuf> {
        self.data_root
            .clone()
            .or_else(|| self.home.as_ref().map(|home| home.join(DATA_DIR_NAME)))
    }

    pub fn provider_name(&self) -> &str {
        self.provider.as_deref().unwrap_or(DEFAULT_PROVIDER_NAME)
    }

    /// Parses `KEY=VALUE;KEY=VALUE`. Empty segments are skipped.
    pub fn provider_env(&self) -> Result<BTreeMap<String, String>, BridgeError> {
        let Some(raw) = &self.provider_env else {
            return Ok(BTreeMap::new());
        };

        let mut env = BTreeMap::new();
        for pair in raw.split(';').map(str::trim).filter(|pair| !pair.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(BridgeError::invalid(
                    PROVIDER_ENV_VAR,
                    pair,
                    "expected KEY=VALUE",
                ));
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(BridgeError::invalid(PROVIDER_ENV_VAR, pair, "empty key"));
            }
            env.insert(key.to_string(), value.to_string());
        }
        Ok(env)
    }

    pub fn mock_delay_ms(&self) -> Result<u64, BridgeError> {
        match &self.mock_delay_ms {
            None => Ok(0),
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| BridgeError::invalid(MOCK_DELAY_VAR, value, "expected milliseconds")),
        }
    }
}

fn env_string_opt(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        if value.trim().is_empty() {
            None
        } else {
            Some(value)
        }
    })
}
