//! Raw engine event to [`Message`] conversion.

use agent_engine::{ContentBlock, EngineEvent, MessageBody};

use crate::message::{Message, Role};

/// Texts the engine uses to mark a turn the user interrupted.
pub const INTERRUPT_MARKERS: [&str; 2] = [
    "[Request interrupted by user]",
    "[Request interrupted by user for tool use]",
];

const COMMAND_TAGS: [&str; 4] = [
    "command-name",
    "command-args",
    "local-command-stdout",
    "local-command-stderr",
];

/// Converts one engine event into a transcript message.
///
/// Every event yields a message; system and result messages carry a short
/// summary and are kept out of the rendered list by the caller.
#[must_use]
pub fn convert_event(event: &EngineEvent) -> Message {
    match event {
        EngineEvent::System(system) => Message::text(Role::System, system.subtype.clone()),
        EngineEvent::Result(result) => Message::text(
            Role::Result,
            result.result.clone().unwrap_or_else(|| result.subtype.clone()),
        ),
        EngineEvent::Assistant(assistant) => {
            convert_body(Role::Assistant, &assistant.message.content)
                .with_id(assistant.message.id.clone())
        }
        EngineEvent::User(user) => convert_user(&user.message.content),
    }
}

fn convert_body(role: Role, body: &MessageBody) -> Message {
    match body {
        MessageBody::Text(text) => Message::text(role, text.clone()),
        MessageBody::Blocks(blocks) => Message::blocks(role, blocks.clone()),
    }
}

fn convert_user(body: &MessageBody) -> Message {
    match body {
        MessageBody::Text(text) => {
            convert_user_text(text).unwrap_or_else(|| Message::text(Role::User, text.clone()))
        }
        MessageBody::Blocks(blocks) => {
            if let [ContentBlock::Text { text }] = blocks.as_slice() {
                if let Some(message) = convert_user_text(text) {
                    return message;
                }
            }
            // Interrupt markers may also trail tool results in one user event.
            Message::blocks(Role::User, blocks.iter().map(mark_interrupt).collect())
        }
    }
}

fn convert_user_text(text: &str) -> Option<Message> {
    if let Some(marker) = interrupt_marker(text) {
        return Some(Message::blocks(
            Role::User,
            vec![ContentBlock::Interrupt {
                text: marker.to_string(),
            }],
        ));
    }
    slash_command_output(text).map(|output| Message::text(Role::SlashCommandResult, output))
}

fn mark_interrupt(block: &ContentBlock) -> ContentBlock {
    match block {
        ContentBlock::Text { text } => match interrupt_marker(text) {
            Some(marker) => ContentBlock::Interrupt {
                text: marker.to_string(),
            },
            None => block.clone(),
        },
        other => other.clone(),
    }
}

fn interrupt_marker(text: &str) -> Option<&'static str> {
    let trimmed = text.trim();
    INTERRUPT_MARKERS
        .into_iter()
        .find(|marker| trimmed == *marker)
}

/// Extracts the rendered text of a slash-command echo, if `text` is one.
fn slash_command_output(text: &str) -> Option<String> {
    if !COMMAND_TAGS
        .iter()
        .any(|tag| text.contains(&format!("<{tag}>")))
    {
        return None;
    }

    let name = tag_content(text, "command-name");
    let args = tag_content(text, "command-args").filter(|args| !args.is_empty());
    let stdout = tag_content(text, "local-command-stdout");
    let stderr = tag_content(text, "local-command-stderr");

    let mut parts = Vec::new();
    match (name, args) {
        (Some(name), Some(args)) => parts.push(format!("{name} {args}")),
        (Some(name), None) => parts.push(name.to_string()),
        _ => {}
    }
    parts.extend(
        [stdout, stderr]
            .into_iter()
            .flatten()
            .filter(|output| !output.is_empty())
            .map(str::to_string),
    );
    Some(parts.join("\n"))
}

fn tag_content<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(text[start..end].trim())
}
