#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_engine::{
    ContentBlock, EngineEvent, ExecutionEngine, Hooks, PermissionDecision, QueryOptions,
    QueryRequest, StreamChannel, ToolAuthorizer, ToolPermissionRequest, UserTurn,
};
use agent_engine_cli::{CliEngine, CliEngineConfig};
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::oneshot;

const ECHO_AGENT: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"cli-1","cwd":"/tmp","model":"fake"}'
while IFS= read -r line; do
  echo '{"type":"assistant","session_id":"cli-1","message":{"content":[{"type":"text","text":"echo"}]}}'
  echo '{"type":"result","subtype":"success","is_error":false,"session_id":"cli-1"}'
done
"#;

const ASKING_AGENT: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"cli-2"}'
IFS= read -r line
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_1","name":"Bash","input":{"command":"ls"}}]}}'
echo '{"type":"control_request","request_id":"perm-1","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"ls"},"tool_use_id":"toolu_1"}}'
IFS= read -r reply
case "$reply" in
  *'"behavior":"deny"'*) verdict=denied ;;
  *) verdict=allowed ;;
esac
echo "{\"type\":\"user\",\"message\":{\"content\":[{\"type\":\"tool_result\",\"tool_use_id\":\"toolu_1\",\"content\":\"$verdict\"}]}}"
echo '{"type":"result","subtype":"success","is_error":false}'
"#;

const CANCELLING_AGENT: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"cli-3"}'
IFS= read -r line
echo '{"type":"control_request","request_id":"perm-9","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"rm -rf build"},"tool_use_id":"toolu_9"}}'
sleep 0.2
echo '{"type":"control_cancel_request","request_id":"perm-9"}'
sleep 10
"#;

const FAILING_AGENT: &str = r#"#!/bin/sh
echo 'quota exhausted' >&2
exit 3
"#;

fn write_agent(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-agent");
    fs::write(&path, body).expect("write fake agent");
    let mut permissions = fs::metadata(&path).expect("agent metadata").permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&path, permissions).expect("chmod fake agent");
    path
}

struct RecordingAuthorizer {
    seen: Mutex<Vec<String>>,
    decision: PermissionDecision,
}

#[async_trait]
impl ToolAuthorizer for RecordingAuthorizer {
    async fn authorize(&self, request: ToolPermissionRequest) -> PermissionDecision {
        self.seen
            .lock()
            .expect("seen lock")
            .push(request.tool_name.clone());
        self.decision.clone()
    }
}

/// Fires its sender when dropped.
struct DropSignal(Option<oneshot::Sender<()>>);

impl Drop for DropSignal {
    fn drop(&mut self) {
        if let Some(sender) = self.0.take() {
            let _ = sender.send(());
        }
    }
}

/// Never answers; reports when its pending future is dropped.
struct StallingAuthorizer {
    dropped: Mutex<Option<oneshot::Sender<()>>>,
}

#[async_trait]
impl ToolAuthorizer for StallingAuthorizer {
    async fn authorize(&self, _request: ToolPermissionRequest) -> PermissionDecision {
        let _signal = DropSignal(self.dropped.lock().expect("dropped lock").take());
        std::future::pending::<PermissionDecision>().await
    }
}

fn query_request(
    cwd: &Path,
    prompt: &StreamChannel<UserTurn>,
    authorizer: Arc<dyn ToolAuthorizer>,
) -> QueryRequest {
    QueryRequest {
        session_id: "local".to_string(),
        prompt: prompt.reader().expect("prompt reader"),
        options: QueryOptions::new(cwd),
        authorizer,
        hooks: Hooks::new(),
    }
}

async fn drain(
    mut events: agent_engine::ChannelReader<EngineEvent>,
) -> Result<Vec<EngineEvent>, agent_engine::ChannelError> {
    let mut collected = Vec::new();
    while let Some(event) = events.next().await? {
        collected.push(event);
    }
    Ok(collected)
}

#[tokio::test]
async fn turns_round_trip_through_the_agent_process() {
    let dir = TempDir::new().expect("tempdir");
    let agent = write_agent(dir.path(), ECHO_AGENT);
    let engine = CliEngine::new(CliEngineConfig::new(agent));
    let prompt = StreamChannel::new();
    prompt.enqueue(UserTurn::text("hello"));
    prompt.done();

    let query = engine
        .query(query_request(
            dir.path(),
            &prompt,
            Arc::new(agent_engine::AllowAll),
        ))
        .await
        .expect("agent spawns");
    let events = drain(query.events).await.expect("agent exits cleanly");

    assert_eq!(events.len(), 3);
    assert_eq!(events[0].session_id(), Some("cli-1"));
    assert!(events[2].is_turn_end());
}

#[tokio::test]
async fn permission_requests_are_answered_through_the_authorizer() {
    let dir = TempDir::new().expect("tempdir");
    let agent = write_agent(dir.path(), ASKING_AGENT);
    let engine = CliEngine::new(CliEngineConfig::new(agent));
    let authorizer = Arc::new(RecordingAuthorizer {
        seen: Mutex::new(Vec::new()),
        decision: PermissionDecision::deny("not allowed", false),
    });
    let prompt = StreamChannel::new();
    prompt.enqueue(UserTurn::text("list files"));
    prompt.done();

    let query = engine
        .query(query_request(dir.path(), &prompt, authorizer.clone()))
        .await
        .expect("agent spawns");
    let events = drain(query.events).await.expect("agent exits cleanly");

    assert_eq!(*authorizer.seen.lock().expect("seen lock"), vec!["Bash"]);
    let result_text = events
        .iter()
        .find_map(|event| match event {
            EngineEvent::User(user) => user
                .message
                .content
                .iter_blocks()
                .find_map(ContentBlock::as_tool_result)
                .map(|result| result.content_text()),
            _ => None,
        })
        .expect("tool result forwarded");
    assert_eq!(result_text, "denied");
}

#[tokio::test]
async fn cancelled_permission_requests_drop_the_pending_authorizer() {
    let dir = TempDir::new().expect("tempdir");
    let agent = write_agent(dir.path(), CANCELLING_AGENT);
    let engine = CliEngine::new(CliEngineConfig::new(agent));
    let (dropped, was_dropped) = oneshot::channel();
    let authorizer = Arc::new(StallingAuthorizer {
        dropped: Mutex::new(Some(dropped)),
    });
    let prompt = StreamChannel::new();
    prompt.enqueue(UserTurn::text("clean up"));

    let query = engine
        .query(query_request(dir.path(), &prompt, authorizer))
        .await
        .expect("agent spawns");

    // The agent stays alive well past this, so only the cancel can release the prompt.
    tokio::time::timeout(Duration::from_secs(3), was_dropped)
        .await
        .expect("authorizer dropped after cancel")
        .expect("drop signal sent");

    query.control.close();
}

#[tokio::test]
async fn abnormal_exit_fails_the_event_stream_with_stderr_tail() {
    let dir = TempDir::new().expect("tempdir");
    let agent = write_agent(dir.path(), FAILING_AGENT);
    let engine = CliEngine::new(CliEngineConfig::new(agent));
    let prompt = StreamChannel::new();

    let query = engine
        .query(query_request(
            dir.path(),
            &prompt,
            Arc::new(agent_engine::AllowAll),
        ))
        .await
        .expect("agent spawns");
    let error = drain(query.events).await.expect_err("stream must fail");

    assert!(error.to_string().contains("quota exhausted"), "{error}");
}
