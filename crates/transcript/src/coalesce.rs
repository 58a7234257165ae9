use agent_engine::{ContentBlock, ToolResultBlock};
use serde_json::{json, Value};

use crate::message::{ContentBlockWrapper, Message, MessageContent, Role};

pub const READ_TOOL: &str = "Read";
pub const COALESCED_READ_TOOL: &str = "ReadCoalesced";

/// Collapses runs of two or more consecutive successful single-read
/// assistant messages into one synthetic `ReadCoalesced` message.
///
/// A message joins a run only if it is an assistant message whose sole block
/// is a `Read` tool use with a non-error result already associated. Unresolved
/// calls and error results break runs. Order is preserved and applying the
/// function twice gives the same result as applying it once.
#[must_use]
pub fn coalesce_read_calls(messages: Vec<Message>) -> Vec<Message> {
    let mut output = Vec::with_capacity(messages.len());
    let mut run: Vec<Message> = Vec::new();

    for message in messages {
        if read_input(&message).is_some() {
            run.push(message);
            continue;
        }
        flush_run(&mut run, &mut output);
        output.push(message);
    }
    flush_run(&mut run, &mut output);

    output
}

fn flush_run(run: &mut Vec<Message>, output: &mut Vec<Message>) {
    match run.len() {
        0 => {}
        1 => output.append(run),
        _ => output.push(merge_run(std::mem::take(run))),
    }
}

fn merge_run(run: Vec<Message>) -> Message {
    let files: Vec<Value> = run
        .iter()
        .filter_map(read_input)
        .cloned()
        .collect();
    let first = &run[0];
    let id = first
        .wrappers()
        .first()
        .and_then(ContentBlockWrapper::tool_use)
        .map(|tool_use| tool_use.id.clone())
        .unwrap_or_default();

    let wrapper = ContentBlockWrapper::new(ContentBlock::tool_use(
        id.clone(),
        COALESCED_READ_TOOL,
        json!({ "files": files }),
    ));
    wrapper.set_tool_result(ToolResultBlock::success(
        id,
        format!("Read {} files", files.len()),
    ));

    Message {
        role: Role::Assistant,
        content: MessageContent::Blocks(vec![wrapper]),
        timestamp: first.timestamp,
        id: first.id.clone(),
    }
}

/// Returns the `Read` input when `message` can join a coalescible run.
fn read_input(message: &Message) -> Option<&Value> {
    if message.role != Role::Assistant {
        return None;
    }
    let [wrapper] = message.wrappers() else {
        return None;
    };
    let tool_use = wrapper.tool_use()?;
    if tool_use.name != READ_TOOL {
        return None;
    }
    match wrapper.tool_result() {
        Some(result) if !result.is_error => Some(&tool_use.input),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn read(id: &str, path: &str, result: Option<ToolResultBlock>) -> Message {
        let message = Message::blocks(
            Role::Assistant,
            vec![ContentBlock::tool_use(id, READ_TOOL, json!({ "file_path": path }))],
        );
        if let Some(result) = result {
            message.wrappers()[0].set_tool_result(result);
        }
        message
    }

    fn ok(id: &str) -> Option<ToolResultBlock> {
        Some(ToolResultBlock::success(id, "contents"))
    }

    fn tool_names(messages: &[Message]) -> Vec<String> {
        messages
            .iter()
            .map(|message| {
                let first = message.wrappers().first();
                match first.and_then(ContentBlockWrapper::tool_use) {
                    Some(tool_use) => tool_use.name.clone(),
                    None => message.plain_text(),
                }
            })
            .collect()
    }

    #[test]
    fn three_successful_reads_become_one_synthetic_message() {
        let messages = vec![
            read("t1", "/a", ok("t1")),
            read("t2", "/b", ok("t2")),
            read("t3", "/c", ok("t3")),
        ];

        let coalesced = coalesce_read_calls(messages);

        assert_eq!(coalesced.len(), 1);
        let wrapper = &coalesced[0].wrappers()[0];
        let tool_use = wrapper.tool_use().expect("synthetic tool use");
        assert_eq!(tool_use.name, COALESCED_READ_TOOL);
        assert_eq!(
            tool_use.input,
            json!({"files": [{"file_path": "/a"}, {"file_path": "/b"}, {"file_path": "/c"}]})
        );
        let result = wrapper.tool_result().expect("synthetic result");
        assert!(!result.is_error);
        assert!(result.content_text().contains('3'));
    }

    #[test]
    fn single_reads_unresolved_and_failed_calls_break_runs() {
        let messages = vec![
            read("t1", "/a", ok("t1")),
            Message::text(Role::Assistant, "thinking out loud"),
            read("t2", "/b", ok("t2")),
            read("t3", "/c", None),
            read("t4", "/d", ok("t4")),
            read("t5", "/e", Some(ToolResultBlock::error("t5", "missing"))),
            read("t6", "/f", ok("t6")),
            read("t7", "/g", ok("t7")),
        ];

        let coalesced = coalesce_read_calls(messages);

        assert_eq!(
            tool_names(&coalesced),
            vec![
                "Read",
                "thinking out loud",
                "Read",
                "Read",
                "Read",
                "Read",
                COALESCED_READ_TOOL,
            ]
        );
    }

    #[test]
    fn non_assistant_and_mixed_messages_are_left_alone() {
        let mixed = Message::blocks(
            Role::Assistant,
            vec![
                ContentBlock::text("reading"),
                ContentBlock::tool_use("t9", READ_TOOL, json!({})),
            ],
        );
        mixed.wrappers()[1].set_tool_result(ToolResultBlock::success("t9", "x"));
        let user = Message::text(Role::User, "hi");

        let coalesced = coalesce_read_calls(vec![mixed, read("t1", "/a", ok("t1")), user]);

        assert_eq!(coalesced.len(), 3);
    }

    #[test]
    fn coalescing_is_idempotent() {
        let messages = vec![
            read("t1", "/a", ok("t1")),
            read("t2", "/b", ok("t2")),
            Message::text(Role::User, "next"),
            read("t3", "/c", ok("t3")),
            read("t4", "/d", ok("t4")),
        ];

        let once = coalesce_read_calls(messages);
        let once_names = tool_names(&once);
        let twice = coalesce_read_calls(once);

        assert_eq!(tool_names(&twice), once_names);
        assert_eq!(twice.len(), 3);
    }
}
