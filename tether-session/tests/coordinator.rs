//! End-to-end runs of the coordinator against `/bin/sh` scripts that print
//! canned stream-json output.

#![cfg(unix)]

use std::sync::mpsc::{Receiver, channel};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tether_api::{ConversationConfig, ConversationEvent, ConversationId, Role, TranscriptEntry};
use tether_session::{Backend, Coordinator, MemorySink, SessionError, SqliteStore, TranscriptSink};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(15);

/// A backend whose "agent" is `script`; the prompt is `$2`.
fn script_backend(script: &str) -> Backend {
    Backend::custom("/bin/sh").with_leading_args(["-c", script, "agent"])
}

async fn next_event(rx: &mut UnboundedReceiver<ConversationEvent>) -> ConversationEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Collect events up to and including the first one matching `done`.
async fn collect_until(
    rx: &mut UnboundedReceiver<ConversationEvent>,
    done: impl Fn(&ConversationEvent) -> bool,
) -> Vec<ConversationEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(rx).await;
        let finished = done(&event);
        events.push(event);
        if finished {
            return events;
        }
    }
}

fn exited(event: &ConversationEvent) -> bool {
    matches!(event, ConversationEvent::ProcessExited { .. })
}

const SCENARIO: &str = r#"
printf '%s\n' '{"type":"system","subtype":"init","session_id":"abc","model":"test-model","tools":["Read"]}'
printf '%s' '{"type":"stream_event","event":{"type":"message_start","message":{"id":"m1","usage":{"input_tokens":10,"output_tokens":0}}}}'
printf '%s\n' '{"type":"stream_event","event":{"type":"content_block_start","index":0,"content_block":{"type":"text"}}}'
printf '%s\n' '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}}'
printf '%s\n' '{"type":"stream_event","event":{"type":"content_block_stop","index":0}}'
printf '%s\n' '{"type":"stream_event","event":{"type":"message_stop"}}'
printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"total_cost_usd":0.0123,"result":"Hi","session_id":"abc"}'
"#;

#[tokio::test]
async fn test_scenario_reaches_sink_and_observers() {
    let sink = Arc::new(MemorySink::new());
    let (mut coordinator, mut rx) = Coordinator::new(script_backend(SCENARIO), sink.clone());
    let id = ConversationId::from("c1");
    coordinator
        .open(id.clone(), ConversationConfig::new(std::env::temp_dir()))
        .await;

    let process = coordinator.send(&id, "hello").await.unwrap();
    let events = collect_until(&mut rx, exited).await;

    assert!(matches!(
        &events[0],
        ConversationEvent::ProcessStarted { process: p, .. } if *p == process
    ));
    assert!(events.iter().all(|e| e.conversation() == &id));
    assert!(events.iter().any(|e| matches!(
        e,
        ConversationEvent::ResumeCaptured { resume_id, .. } if resume_id == "abc"
    )));
    assert!(matches!(
        events.last(),
        Some(ConversationEvent::ProcessExited { code: Some(0), .. })
    ));

    // Observers see the partial, then the final, for m1.
    let m1: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ConversationEvent::Entry { entry, .. } if entry.id == "m1" => Some(entry),
            _ => None,
        })
        .collect();
    assert_eq!(m1.len(), 2);
    assert!(m1[0].is_partial);
    assert_eq!(m1[0].content, "Hi");
    assert!(!m1[1].is_partial);
    assert_eq!(m1[1].content, "Hi");

    // The sink only sees final entries.
    let transcript = sink.transcript(&id);
    assert!(transcript.iter().all(|e| !e.is_partial));
    let assistant = transcript.iter().find(|e| e.id == "m1").unwrap();
    assert_eq!(assistant.role, Role::Assistant);
    assert_eq!(assistant.usage.unwrap().input_tokens, 10);
    let last = transcript.last().unwrap();
    assert_eq!(last.role, Role::System);
    assert!(last.content.starts_with("Turn completed"));
    assert!(!last.is_error);

    assert_eq!(sink.resume_id(&id).as_deref(), Some("abc"));
    let config = coordinator.config(&id).await.unwrap();
    assert_eq!(config.resume_id.as_deref(), Some("abc"));
    assert_eq!(config.model.as_deref(), Some("test-model"));
    assert!(!coordinator.is_live(&id));
}

#[tokio::test]
async fn test_captured_resume_id_is_replayed() {
    let dir = tempfile::tempdir().unwrap();
    let args_file = dir.path().join("args");
    let script = r#"
printf '%s\n' "$@" > "$TETHER_ARGS"
printf '%s\n' '{"type":"system","subtype":"init","session_id":"abc","tools":[]}'
"#;
    let backend = script_backend(script).with_env("TETHER_ARGS", args_file.display().to_string());
    let (mut coordinator, mut rx) = Coordinator::new(backend, Arc::new(MemorySink::new()));
    let id = ConversationId::from("c1");
    coordinator
        .open(id.clone(), ConversationConfig::new(dir.path()))
        .await;

    coordinator.send(&id, "first").await.unwrap();
    collect_until(&mut rx, exited).await;
    let first = std::fs::read_to_string(&args_file).unwrap();
    assert!(!first.lines().any(|l| l == "--resume"));

    coordinator.send(&id, "second").await.unwrap();
    collect_until(&mut rx, exited).await;
    let second = std::fs::read_to_string(&args_file).unwrap();
    let args: Vec<_> = second.lines().collect();
    let flag = args.iter().position(|a| *a == "--resume").unwrap();
    assert_eq!(args[flag + 1], "abc");
    assert!(args.contains(&"second"));
}

const SLOW: &str = r#"
printf '%s\n' "{\"type\":\"message_start\",\"message\":{\"id\":\"m-$2\"}}"
printf '%s\n' '{"type":"content_block_start","index":0,"content_block":{"type":"text"}}'
printf '%s\n' "{\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"$2\"}}"
exec sleep 30
"#;

#[tokio::test]
async fn test_second_send_replaces_live_process() {
    let (mut coordinator, mut rx) =
        Coordinator::new(script_backend(SLOW), Arc::new(MemorySink::new()));
    let id = ConversationId::from("c1");
    coordinator
        .open(id.clone(), ConversationConfig::new(std::env::temp_dir()))
        .await;

    let first = coordinator.send(&id, "one").await.unwrap();
    collect_until(&mut rx, |e| {
        matches!(e, ConversationEvent::Entry { entry, .. } if entry.content == "one")
    })
    .await;
    assert!(coordinator.is_live(&id));

    let second = coordinator.send(&id, "two").await.unwrap();
    assert_ne!(first, second);
    assert!(coordinator.is_live(&id));

    let events = collect_until(&mut rx, |e| {
        matches!(e, ConversationEvent::Entry { entry, .. } if entry.content == "two")
    })
    .await;

    let killed = events
        .iter()
        .position(|e| matches!(e, ConversationEvent::ProcessKilled { process, .. } if *process == first))
        .unwrap();
    let started = events
        .iter()
        .position(|e| matches!(e, ConversationEvent::ProcessStarted { process, .. } if *process == second))
        .unwrap();
    assert!(killed < started);
    assert!(events[started..].iter().all(|e| match e {
        ConversationEvent::Entry { entry, .. } => entry.id != "m-one",
        ConversationEvent::ProcessKilled { .. } | ConversationEvent::ProcessExited { .. } => false,
        _ => true,
    }));

    assert!(coordinator.stop(&id).await.unwrap());
    assert!(!coordinator.is_live(&id));
    assert!(matches!(
        next_event(&mut rx).await,
        ConversationEvent::ProcessKilled { process, .. } if process == second
    ));
    assert!(!coordinator.stop(&id).await.unwrap());

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_stop_drops_the_unfinished_message() {
    let sink = Arc::new(MemorySink::new());
    let (mut coordinator, mut rx) = Coordinator::new(script_backend(SLOW), sink.clone());
    let id = ConversationId::from("c1");
    coordinator
        .open(id.clone(), ConversationConfig::new(std::env::temp_dir()))
        .await;

    coordinator.send(&id, "one").await.unwrap();
    let mut events = collect_until(&mut rx, |e| {
        matches!(e, ConversationEvent::Entry { entry, .. } if entry.content == "one")
    })
    .await;
    assert!(coordinator.stop(&id).await.unwrap());
    events.extend(collect_until(&mut rx, |e| matches!(e, ConversationEvent::ProcessKilled { .. })).await);

    // Nothing more arrives once the kill is reported.
    coordinator.shutdown().await;
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    let m_one: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ConversationEvent::Entry { entry, .. } if entry.id == "m-one" => Some(entry),
            _ => None,
        })
        .collect();
    assert!(!m_one.is_empty());
    assert!(m_one.iter().all(|e| e.is_partial));
    assert!(!events.iter().any(|e| matches!(e, ConversationEvent::ProcessExited { .. })));
    assert!(sink.transcript(&id).iter().all(|e| e.id != "m-one"));
}

/// Holds every write until the test lets it through.
struct GatedSink {
    gate: Mutex<Receiver<()>>,
    inner: MemorySink,
}

impl GatedSink {
    fn wait(&self) {
        let gate = self.gate.lock().unwrap();
        let _ = gate.recv_timeout(Duration::from_secs(10));
    }
}

impl TranscriptSink for GatedSink {
    fn record_entry(&self, conversation: &ConversationId, entry: &TranscriptEntry) -> anyhow::Result<()> {
        self.wait();
        self.inner.record_entry(conversation, entry)
    }

    fn record_resume_id(&self, conversation: &ConversationId, resume_id: &str) -> anyhow::Result<()> {
        self.wait();
        self.inner.record_resume_id(conversation, resume_id)
    }
}

#[tokio::test]
async fn test_blocking_sink_does_not_stall_the_runtime() {
    let (open, gate) = channel();
    let sink = Arc::new(GatedSink {
        gate: Mutex::new(gate),
        inner: MemorySink::new(),
    });
    let (mut coordinator, mut rx) = Coordinator::new(script_backend(SCENARIO), sink.clone());
    let id = ConversationId::from("c1");
    coordinator
        .open(id.clone(), ConversationConfig::new(std::env::temp_dir()))
        .await;

    let started = Instant::now();
    coordinator.send(&id, "hello").await.unwrap();

    // The worker is parked on a write by now; this task must still run.
    tokio::time::sleep(Duration::from_millis(200)).await;
    for _ in 0..8 {
        open.send(()).unwrap();
    }
    collect_until(&mut rx, exited).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(sink.inner.transcript(&id).iter().any(|e| e.id == "m1" && !e.is_partial));
    assert_eq!(sink.inner.resume_id(&id).as_deref(), Some("abc"));
}

#[tokio::test]
async fn test_nonzero_exit_reports_stderr() {
    let sink = Arc::new(MemorySink::new());
    let (mut coordinator, mut rx) =
        Coordinator::new(script_backend("echo 'not logged in' >&2; exit 2"), sink.clone());
    let id = ConversationId::from("c1");
    coordinator
        .open(id.clone(), ConversationConfig::new(std::env::temp_dir()))
        .await;

    coordinator.send(&id, "hi").await.unwrap();
    let events = collect_until(&mut rx, exited).await;

    assert!(matches!(
        events.last(),
        Some(ConversationEvent::ProcessExited { code: Some(2), .. })
    ));
    let transcript = sink.transcript(&id);
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].role, Role::System);
    assert!(transcript[0].is_error);
    assert!(transcript[0].content.contains("status 2"));
    assert!(transcript[0].content.contains("not logged in"));
}

#[tokio::test]
async fn test_error_result_is_not_doubled_by_exit_code() {
    let sink = Arc::new(MemorySink::new());
    let script = r#"
printf '%s\n' '{"type":"result","subtype":"error_during_execution","is_error":true,"result":"rate limited"}'
exit 1
"#;
    let (mut coordinator, mut rx) = Coordinator::new(script_backend(script), sink.clone());
    let id = ConversationId::from("c1");
    coordinator
        .open(id.clone(), ConversationConfig::new(std::env::temp_dir()))
        .await;

    coordinator.send(&id, "hi").await.unwrap();
    collect_until(&mut rx, exited).await;

    let transcript = sink.transcript(&id);
    assert_eq!(transcript.len(), 1);
    assert!(transcript[0].is_error);
    assert_eq!(transcript[0].content, "rate limited");
}

#[tokio::test]
async fn test_noise_and_malformed_objects_do_not_stop_the_turn() {
    let script = r#"
printf 'Loading configuration...\n'
printf '%s\n' '{"type":"message_start","message":{"id":"m1"}}'
printf '%s\n' '{"type": oops}'
printf '%s\n' '{"type":"content_block_start","index":0,"content_block":{"type":"text"}}'
printf '%s\n' '{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"ok"}}'
printf '%s\n' '{"type":"message_stop"}'
"#;
    let sink = Arc::new(MemorySink::new());
    let (mut coordinator, mut rx) = Coordinator::new(script_backend(script), sink.clone());
    let id = ConversationId::from("c1");
    coordinator
        .open(id.clone(), ConversationConfig::new(std::env::temp_dir()))
        .await;

    coordinator.send(&id, "hi").await.unwrap();
    let events = collect_until(&mut rx, exited).await;

    assert!(events.iter().any(|e| matches!(e, ConversationEvent::Diagnostic { .. })));
    let transcript = sink.transcript(&id);
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].content, "ok");
}

#[tokio::test]
async fn test_spawn_failure_is_terminal_for_the_send() {
    let (mut coordinator, mut rx) = Coordinator::new(
        Backend::custom("/nonexistent/agent-cli"),
        Arc::new(MemorySink::new()),
    );
    let id = ConversationId::from("c1");
    coordinator
        .open(id.clone(), ConversationConfig::new(std::env::temp_dir()))
        .await;

    let err = coordinator.send(&id, "hi").await.unwrap_err();
    assert!(matches!(err, SessionError::Spawn { .. }));
    assert!(!coordinator.is_live(&id));
    assert!(rx.try_recv().is_err());

    // The conversation stays usable.
    assert!(coordinator.config(&id).await.is_ok());
}

#[tokio::test]
async fn test_sqlite_store_as_sink() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let sink: Arc<dyn TranscriptSink> = store.clone();
    let (mut coordinator, mut rx) = Coordinator::new(script_backend(SCENARIO), sink);
    let id = ConversationId::from("c1");
    coordinator
        .open(id.clone(), ConversationConfig::new(std::env::temp_dir()))
        .await;

    coordinator.send(&id, "hello").await.unwrap();
    collect_until(&mut rx, exited).await;

    let transcript = store.load_transcript(&id).unwrap();
    assert!(transcript.iter().any(|e| e.id == "m1" && e.content == "Hi"));
    assert_eq!(store.load_resume_id(&id).unwrap().as_deref(), Some("abc"));
}
