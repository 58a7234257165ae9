use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Engine-side policy for when tool use needs explicit authorization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
}

impl PermissionMode {
    pub const ALL: [PermissionMode; 4] = [
        Self::Default,
        Self::AcceptEdits,
        Self::Plan,
        Self::BypassPermissions,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::BypassPermissions => "bypassPermissions",
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == value.trim())
            .ok_or_else(|| format!("unknown permission mode '{value}'"))
    }
}

/// Tool authorization request raised by an engine before running a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPermissionRequest {
    pub tool_name: String,
    pub input: Value,
    /// Policy updates the engine suggests applying if the user allows.
    pub suggestions: Vec<Value>,
    pub tool_use_id: Option<String>,
}

/// Resolution of one tool authorization request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow {
        #[serde(rename = "updatedInput")]
        updated_input: Value,
        #[serde(
            default,
            rename = "updatedPermissions",
            skip_serializing_if = "Vec::is_empty"
        )]
        updated_permissions: Vec<Value>,
    },
    Deny {
        message: String,
        #[serde(default)]
        interrupt: bool,
    },
}

impl PermissionDecision {
    #[must_use]
    pub fn allow(updated_input: Value) -> Self {
        Self::Allow {
            updated_input,
            updated_permissions: Vec::new(),
        }
    }

    #[must_use]
    pub fn deny(message: impl Into<String>, interrupt: bool) -> Self {
        Self::Deny {
            message: message.into(),
            interrupt,
        }
    }

    #[must_use]
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }

    /// Returns true for a denial that also stops the current turn.
    #[must_use]
    pub fn interrupts(&self) -> bool {
        matches!(self, Self::Deny { interrupt: true, .. })
    }
}

/// Authorization callback handed to an engine for every query.
///
/// The returned future resolves only once the request has been decided; the
/// engine suspends the affected execution step until then.
#[async_trait]
pub trait ToolAuthorizer: Send + Sync {
    async fn authorize(&self, request: ToolPermissionRequest) -> PermissionDecision;
}

/// Authorizer that allows every request unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl ToolAuthorizer for AllowAll {
    async fn authorize(&self, request: ToolPermissionRequest) -> PermissionDecision {
        PermissionDecision::allow(request.input)
    }
}
