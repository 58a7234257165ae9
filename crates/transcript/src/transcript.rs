use agent_engine::{ContentBlock, EngineEvent, ToolResultBlock};
use serde_json::Value;

use crate::coalesce::coalesce_read_calls;
use crate::convert::convert_event;
use crate::message::{Message, Role};

/// Associates `result` with the nearest preceding matching tool use.
///
/// Scans `messages` from the end backward, considering assistant messages
/// only. The first wrapper whose `tool_use` id equals `result.tool_use_id`
/// receives the result (notifying subscribers) and, when given, the extended
/// payload. Returns false when no tool use matches.
pub fn associate_tool_result(
    messages: &mut [Message],
    result: &ToolResultBlock,
    extended: Option<&Value>,
) -> bool {
    for message in messages.iter_mut().rev() {
        if message.role != Role::Assistant {
            continue;
        }
        let matched = message.wrappers_mut().iter_mut().find(|wrapper| {
            wrapper
                .tool_use()
                .is_some_and(|tool_use| tool_use.id == result.tool_use_id)
        });
        if let Some(wrapper) = matched {
            wrapper.set_tool_result(result.clone());
            if let Some(extended) = extended {
                wrapper.set_extended_result(extended.clone());
            }
            return true;
        }
    }
    false
}

/// What [`Transcript::apply_event`] did with one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Tool results associated with earlier tool uses.
    pub associated: usize,
    /// Tool results with no matching tool use.
    pub orphaned: usize,
    /// Index of the appended message, if one was appended.
    pub appended: Option<usize>,
}

/// Ordered message list with reconciliation applied on every append.
#[derive(Debug, Default)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one live engine event.
    ///
    /// Tool results carried by the event are associated first; then the
    /// converted message is appended unless it is a system or result message
    /// or has nothing to render.
    pub fn apply_event(&mut self, event: &EngineEvent) -> ApplyOutcome {
        self.apply(event, None)
    }

    /// Like [`apply_event`](Self::apply_event), also attaching `extended` as
    /// the non-reactive extended result of every tool use the event resolves.
    pub fn apply_historical_event(
        &mut self,
        event: &EngineEvent,
        extended: Option<&Value>,
    ) -> ApplyOutcome {
        self.apply(event, extended)
    }

    fn apply(&mut self, event: &EngineEvent, extended: Option<&Value>) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();

        let results: Vec<&ToolResultBlock> = match event {
            EngineEvent::User(user) => user
                .message
                .content
                .iter_blocks()
                .filter_map(ContentBlock::as_tool_result)
                .collect(),
            _ => Vec::new(),
        };
        for result in results {
            if associate_tool_result(&mut self.messages, result, extended) {
                outcome.associated += 1;
            } else {
                outcome.orphaned += 1;
            }
        }

        let message = convert_event(event);
        if message.is_visible() {
            self.messages.push(message);
            outcome.appended = Some(self.messages.len() - 1);
        }
        outcome
    }

    /// Appends a locally produced message (echoed user input, tips).
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Messages a renderer should show.
    pub fn visible_messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|message| message.is_visible())
    }

    /// Detached copy of the visible messages with read bursts coalesced.
    #[must_use]
    pub fn coalesced(&self) -> Vec<Message> {
        coalesce_read_calls(
            self.visible_messages()
                .map(Message::detached_copy)
                .collect(),
        )
    }

    pub fn message_mut(&mut self, index: usize) -> Option<&mut Message> {
        self.messages.get_mut(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn assistant_tool_use(id: &str, name: &str) -> EngineEvent {
        EngineEvent::assistant(None, vec![ContentBlock::tool_use(id, name, json!({}))])
    }

    fn tool_result(result: ToolResultBlock) -> EngineEvent {
        EngineEvent::user(None, vec![ContentBlock::ToolResult(result)])
    }

    #[test]
    fn nearest_preceding_tool_use_wins() {
        let mut transcript = Transcript::new();
        transcript.apply_event(&assistant_tool_use("dup", "Bash"));
        transcript.apply_event(&assistant_tool_use("dup", "Bash"));

        let outcome = transcript.apply_event(&tool_result(ToolResultBlock::success("dup", "ok")));

        assert_eq!(outcome.associated, 1);
        let messages = transcript.messages();
        assert_eq!(messages[0].wrappers()[0].tool_result(), None);
        assert_eq!(
            messages[1].wrappers()[0].tool_result(),
            Some(ToolResultBlock::success("dup", "ok"))
        );
    }

    #[test]
    fn tool_result_only_user_event_is_not_appended_but_associates() {
        let mut transcript = Transcript::new();
        transcript.apply_event(&assistant_tool_use("t1", "Read"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _subscription = transcript.messages()[0].wrappers()[0]
            .tool_result_signal()
            .subscribe(move |result| sink.lock().expect("lock").push(result.clone()));

        let outcome = transcript.apply_event(&tool_result(ToolResultBlock::success("t1", "body")));

        assert_eq!(outcome.appended, None);
        assert_eq!(transcript.len(), 1);
        assert_eq!(
            *seen.lock().expect("lock"),
            vec![Some(ToolResultBlock::success("t1", "body"))]
        );
    }

    #[test]
    fn user_messages_are_never_association_targets() {
        let mut transcript = Transcript::new();
        transcript.push(Message::blocks(
            Role::User,
            vec![ContentBlock::tool_use("t1", "Read", json!({}))],
        ));

        let outcome = transcript.apply_event(&tool_result(ToolResultBlock::success("t1", "x")));

        assert_eq!(outcome.associated, 0);
        assert_eq!(outcome.orphaned, 1);
    }

    #[test]
    fn system_and_result_events_do_not_enter_the_list() {
        let mut transcript = Transcript::new();
        transcript.apply_event(&EngineEvent::init(
            "s",
            "/w",
            None,
            agent_engine::PermissionMode::Default,
        ));
        transcript.apply_event(&EngineEvent::assistant(None, vec![ContentBlock::text("hi")]));
        transcript.apply_event(&EngineEvent::Result(agent_engine::ResultEvent::success(
            None, "done",
        )));

        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript.visible_messages().count(), 1);
    }

    #[test]
    fn historical_events_attach_extended_results() {
        let mut transcript = Transcript::new();
        transcript.apply_event(&assistant_tool_use("t1", "Read"));

        transcript.apply_historical_event(
            &tool_result(ToolResultBlock::success("t1", "body")),
            Some(&json!({"file": {"numLines": 3}})),
        );

        assert_eq!(
            transcript.messages()[0].wrappers()[0].extended_result(),
            Some(&json!({"file": {"numLines": 3}}))
        );
    }
}
