use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::TempDir;
use transcript::{Role, COALESCED_READ_TOOL};
use transcript_store::{
    list_transcripts, transcript_path, TranscriptLog, TranscriptStoreError,
};

fn write_lines(path: &Path, lines: &[Value]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("parent dirs should be created");
    }
    let mut file = File::create(path).expect("transcript file should be created");
    for line in lines {
        writeln!(file, "{line}").expect("line should be written");
    }
}

fn write_transcript(lines: &[Value]) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = dir.path().join("session-1.jsonl");
    write_lines(&path, lines);
    (dir, path)
}

fn user_text_line(ts: &str, text: &str) -> Value {
    json!({
        "type": "user",
        "sessionId": "session-1",
        "cwd": "/work/app",
        "timestamp": ts,
        "message": {"role": "user", "content": text},
    })
}

fn read_call_line(ts: &str, id: &str, file: &str) -> Value {
    json!({
        "type": "assistant",
        "sessionId": "session-1",
        "timestamp": ts,
        "message": {
            "id": format!("msg_{id}"),
            "role": "assistant",
            "content": [{"type": "tool_use", "id": id, "name": "Read", "input": {"file_path": file}}],
        },
    })
}

fn read_result_line(ts: &str, id: &str, lines: u64) -> Value {
    json!({
        "type": "user",
        "sessionId": "session-1",
        "timestamp": ts,
        "message": {
            "role": "user",
            "content": [{"type": "tool_result", "tool_use_id": id, "content": "body"}],
        },
        "toolUseResult": {"type": "text", "file": {"numLines": lines}},
    })
}

#[test]
fn open_replays_conversation_and_attaches_extended_results() {
    let (_dir, path) = write_transcript(&[
        json!({"type": "summary", "summary": "Inspect sources", "leafUuid": "x"}),
        user_text_line("2026-02-14T00:00:00Z", "look at the sources"),
        read_call_line("2026-02-14T00:00:01Z", "r1", "/a.rs"),
        read_result_line("2026-02-14T00:00:02Z", "r1", 10),
        read_call_line("2026-02-14T00:00:03Z", "r2", "/b.rs"),
        read_result_line("2026-02-14T00:00:04Z", "r2", 20),
    ]);

    let log = TranscriptLog::open(&path).expect("transcript should load");
    assert_eq!(log.session_id(), Some("session-1"));
    assert_eq!(log.summary(), Some("Inspect sources"));
    assert_eq!(log.cwd(), Some("/work/app"));
    assert_eq!(log.events().len(), 5);

    let transcript = log.to_transcript();
    let messages = transcript.messages();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].timestamp.unix_timestamp(), 1_771_027_200);
    assert_eq!(
        messages[2].wrappers()[0].extended_result(),
        Some(&json!({"type": "text", "file": {"numLines": 20}}))
    );

    let coalesced = transcript.coalesced();
    assert_eq!(coalesced.len(), 2);
    let tool_use = coalesced[1].wrappers()[0]
        .tool_use()
        .expect("coalesced tool use");
    assert_eq!(tool_use.name, COALESCED_READ_TOOL);
}

#[test]
fn sidechain_meta_and_unknown_records_are_skipped() {
    let (_dir, path) = write_transcript(&[
        user_text_line("2026-02-14T00:00:00Z", "hi"),
        json!({"type": "user", "isMeta": true, "message": {"role": "user", "content": "caveat"}}),
        json!({"type": "assistant", "isSidechain": true, "message": {"content": "sub agent"}}),
        json!({"type": "file-history-snapshot", "snapshot": {}}),
    ]);

    let log = TranscriptLog::open(&path).expect("transcript should load");

    assert_eq!(log.events().len(), 1);
    assert_eq!(log.skipped(), 3);
}

#[test]
fn open_reports_path_and_line_for_malformed_json() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = dir.path().join("broken.jsonl");
    fs::write(
        &path,
        format!("{}\n\n{{not json\n", user_text_line("2026-02-14T00:00:00Z", "hi")),
    )
    .expect("file should be written");

    let error = TranscriptLog::open(&path)
        .err()
        .expect("malformed line must fail");
    match error {
        TranscriptStoreError::JsonLineParse { path: at, line, .. } => {
            assert_eq!(at, path);
            assert_eq!(line, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn open_rejects_invalid_timestamps() {
    let (_dir, path) = write_transcript(&[user_text_line("yesterday", "hi")]);

    let error = TranscriptLog::open(&path)
        .err()
        .expect("bad timestamp must fail");
    assert!(matches!(
        error,
        TranscriptStoreError::InvalidTimestamp {
            line: 1,
            field: "timestamp",
            ..
        }
    ));
}

#[test]
fn conversation_lines_require_a_message() {
    let (_dir, path) = write_transcript(&[json!({"type": "assistant", "sessionId": "s"})]);

    let error = TranscriptLog::open(&path)
        .err()
        .expect("missing message must fail");
    assert!(matches!(
        error,
        TranscriptStoreError::MissingMessage { line: 1, .. }
    ));
}

#[test]
fn session_id_falls_back_to_file_stem() {
    let (_dir, path) = write_transcript(&[json!({"type": "summary", "summary": "only"})]);

    let log = TranscriptLog::open(&path).expect("transcript should load");

    assert_eq!(log.session_id(), Some("session-1"));
    assert!(log.to_transcript().is_empty());
}

#[test]
fn find_and_list_walk_project_directories() {
    let home = tempfile::tempdir().expect("tempdir should be created");
    let first = transcript_path(home.path(), Path::new("/work/app"), "aaa");
    let second = transcript_path(home.path(), Path::new("/work/lib"), "bbb");
    write_lines(
        &first,
        &[
            json!({"type": "summary", "summary": "Fix the build"}),
            user_text_line("2026-02-14T00:00:00Z", "fix it"),
        ],
    );
    write_lines(
        &second,
        &[user_text_line("2026-02-14T00:00:00Z", "add tests\nplease")],
    );
    fs::write(first.with_file_name("notes.txt"), "ignored").expect("file should be written");

    let found = TranscriptLog::find(home.path(), "bbb").expect("bbb should be found");
    assert_eq!(found.path(), second.as_path());

    let missing = TranscriptLog::find(home.path(), "zzz")
        .err()
        .expect("unknown session must fail");
    assert!(matches!(
        missing,
        TranscriptStoreError::TranscriptNotFound { .. }
    ));

    let mut listed = list_transcripts(home.path()).expect("listing should succeed");
    listed.sort_by(|left, right| left.session_id.cmp(&right.session_id));
    let titles: Vec<_> = listed
        .iter()
        .map(|summary| (summary.session_id.as_str(), summary.title.as_deref()))
        .collect();
    assert_eq!(
        titles,
        vec![("aaa", Some("Fix the build")), ("bbb", Some("add tests"))]
    );
    assert_eq!(listed[0].project, "-work-app");
}

#[test]
fn listing_without_projects_directory_is_empty() {
    let home = tempfile::tempdir().expect("tempdir should be created");

    assert!(list_transcripts(home.path())
        .expect("listing should succeed")
        .is_empty());
}
