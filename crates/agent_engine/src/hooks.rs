//! Synchronous interception points around tool execution.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::events::ToolResultBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// After the engine selected a tool, before it runs.
    PreToolUse,
    /// After a tool produced its result.
    PostToolUse,
}

/// What a hook callback sees for one tool call.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub point: HookPoint,
    pub tool_name: &'a str,
    pub input: &'a Value,
    pub tool_use_id: Option<&'a str>,
    /// Present at [`HookPoint::PostToolUse`] only.
    pub result: Option<&'a ToolResultBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    Continue,
    Block { reason: String },
}

impl HookDecision {
    #[must_use]
    pub fn block(reason: impl Into<String>) -> Self {
        Self::Block {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_block(&self) -> bool {
        matches!(self, Self::Block { .. })
    }
}

pub type HookCallback = Arc<dyn Fn(&HookContext<'_>) -> HookDecision + Send + Sync>;

/// Ordered callback lists per hook point.
#[derive(Clone, Default)]
pub struct Hooks {
    pre_tool_use: Vec<HookCallback>,
    post_tool_use: Vec<HookCallback>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("pre_tool_use", &self.pre_tool_use.len())
            .field("post_tool_use", &self.post_tool_use.len())
            .finish()
    }
}

impl Hooks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        point: HookPoint,
        callback: impl Fn(&HookContext<'_>) -> HookDecision + Send + Sync + 'static,
    ) {
        let callback: HookCallback = Arc::new(callback);
        match point {
            HookPoint::PreToolUse => self.pre_tool_use.push(callback),
            HookPoint::PostToolUse => self.post_tool_use.push(callback),
        }
    }

    #[must_use]
    pub fn with(
        mut self,
        point: HookPoint,
        callback: impl Fn(&HookContext<'_>) -> HookDecision + Send + Sync + 'static,
    ) -> Self {
        self.register(point, callback);
        self
    }

    /// Appends `other`'s callbacks after this set's, point by point.
    pub fn extend(&mut self, other: &Hooks) {
        self.pre_tool_use
            .extend(other.pre_tool_use.iter().map(Arc::clone));
        self.post_tool_use
            .extend(other.post_tool_use.iter().map(Arc::clone));
    }

    /// Runs the callbacks registered for `context.point` in registration
    /// order. The first block stops the chain.
    #[must_use]
    pub fn run(&self, context: &HookContext<'_>) -> HookDecision {
        let callbacks = match context.point {
            HookPoint::PreToolUse => &self.pre_tool_use,
            HookPoint::PostToolUse => &self.post_tool_use,
        };

        for callback in callbacks {
            let decision = callback(context);
            if decision.is_block() {
                return decision;
            }
        }
        HookDecision::Continue
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pre_tool_use.is_empty() && self.post_tool_use.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    fn pre_context<'a>(input: &'a Value) -> HookContext<'a> {
        HookContext {
            point: HookPoint::PreToolUse,
            tool_name: "Bash",
            input,
            tool_use_id: Some("toolu_1"),
            result: None,
        }
    }

    #[test]
    fn callbacks_run_in_order_until_first_block() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&calls);
        let second = Arc::clone(&calls);
        let third = Arc::clone(&calls);

        let hooks = Hooks::new()
            .with(HookPoint::PreToolUse, move |_| {
                first.lock().expect("lock").push("first");
                HookDecision::Continue
            })
            .with(HookPoint::PreToolUse, move |_| {
                second.lock().expect("lock").push("second");
                HookDecision::block("stop")
            })
            .with(HookPoint::PreToolUse, move |_| {
                third.lock().expect("lock").push("third");
                HookDecision::Continue
            });

        let input = json!({});
        assert_eq!(hooks.run(&pre_context(&input)), HookDecision::block("stop"));
        assert_eq!(*calls.lock().expect("lock"), vec!["first", "second"]);
    }

    #[test]
    fn extend_keeps_existing_callbacks_first() {
        let guard = Hooks::new().with(HookPoint::PreToolUse, |_| HookDecision::block("guard"));
        let mut hooks = guard.clone();
        hooks.extend(&Hooks::new().with(HookPoint::PreToolUse, |_| HookDecision::block("user")));

        let input = json!({});
        assert_eq!(hooks.run(&pre_context(&input)), HookDecision::block("guard"));
    }

    #[test]
    fn points_are_independent() {
        let hooks = Hooks::new().with(HookPoint::PostToolUse, |_| HookDecision::block("post"));
        let input = json!({"command": "ls"});

        assert_eq!(hooks.run(&pre_context(&input)), HookDecision::Continue);
        assert!(!hooks.is_empty());
    }
}
