use super::*;
use crate::agents::backend::{ScriptedBackend, ScriptedRun};
use crate::agents::domain::Role;
use serde_json::json;
use std::time::Duration;

fn key() -> ThreadKey {
    ThreadKey::new("srv", "room", "thread-1")
}

fn orchestrator(backend: Arc<ScriptedBackend>, max_continuations: u32) -> RunOrchestrator {
    RunOrchestrator::new(
        backend,
        Vec::new(),
        OrchestratorConfig { max_continuations },
    )
}

async fn settled(orchestrator: &RunOrchestrator) -> RunState {
    let mut rx = orchestrator.subscribe();
    let state = tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| s.is_terminal() || matches!(s, RunState::ToolYielding(_))),
    )
    .await
    .expect("orchestrator did not settle")
    .expect("state channel closed")
    .clone();
    state
}

fn execute_all(pending: &[ToolCallInfo], output: &str) -> Vec<ToolCallInfo> {
    pending
        .iter()
        .cloned()
        .map(|mut call| {
            call.complete(output);
            call
        })
        .collect()
}

#[tokio::test]
async fn test_reply_completes() {
    let backend = Arc::new(ScriptedBackend::replying("Hello there"));
    let orch = orchestrator(backend.clone(), 10);
    orch.start_run(key(), "hi", None).unwrap();

    match settled(&orch).await {
        RunState::Completed {
            conversation,
            run_id,
        } => {
            assert_eq!(conversation.last_assistant_text(), Some("Hello there"));
            assert_eq!(conversation.messages[0].role, Role::User);
            assert!(run_id.starts_with("run-"));
        }
        other => panic!("unexpected state {:?}", other),
    }
    assert_eq!(backend.create_run_count(), 1);
}

#[tokio::test]
async fn test_existing_run_id_is_reused() {
    let backend = Arc::new(ScriptedBackend::replying("ok"));
    let orch = orchestrator(backend.clone(), 10);
    orch.start_run(key(), "hi", Some("run-existing".into()))
        .unwrap();

    match settled(&orch).await {
        RunState::Completed { run_id, .. } => assert_eq!(run_id, "run-existing"),
        other => panic!("unexpected state {:?}", other),
    }
}

#[tokio::test]
async fn test_tool_call_yields_then_completes() {
    let backend = Arc::new(ScriptedBackend::sequence(vec![
        ScriptedRun::tool_call("c1", "get_time", json!({"tz": "UTC"})),
        ScriptedRun::reply("It is 12:00"),
    ]));
    let orch = orchestrator(backend.clone(), 10);
    orch.start_run(key(), "what time is it?", None).unwrap();

    let pending = match settled(&orch).await {
        RunState::ToolYielding(pending) => pending,
        other => panic!("unexpected state {:?}", other),
    };
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].name, "get_time");
    assert_eq!(pending[0].arguments, json!({"tz": "UTC"}));
    assert!(!orch.current_state().is_terminal());

    orch.submit_tool_outputs(execute_all(&pending, "12:00"))
        .unwrap();

    match settled(&orch).await {
        RunState::Completed { conversation, .. } => {
            assert_eq!(conversation.last_assistant_text(), Some("It is 12:00"));
            assert!(conversation.pending_tool_calls().is_empty());
        }
        other => panic!("unexpected state {:?}", other),
    }

    let runs = backend.runs();
    assert_eq!(runs.len(), 2);
    let tool_message = runs[1]
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("tool result sent with continuation");
    assert_eq!(tool_message.content, "12:00");
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("c1"));
}

#[tokio::test]
async fn test_continuation_depth_is_bounded() {
    let backend = Arc::new(ScriptedBackend::new(|ctx| {
        ScriptedRun::tool_call(format!("c{}", ctx.run_index), "loop", json!({}))
    }));
    let max = 3;
    let orch = orchestrator(backend.clone(), max);
    orch.start_run(key(), "go", None).unwrap();

    let mut submissions = 0;
    let final_state = loop {
        match settled(&orch).await {
            RunState::ToolYielding(pending) => {
                submissions += 1;
                orch.submit_tool_outputs(execute_all(&pending, "again"))
                    .unwrap();
            }
            other => break other,
        }
    };

    assert_eq!(
        final_state,
        RunState::Failed {
            reason: FailureReason::InternalError,
            error: "Continuation limit of 3 reached".into(),
        }
    );
    assert_eq!(submissions, max + 1);
    assert_eq!(backend.create_run_count(), 1 + max as usize);
    assert_eq!(orch.continuations(), max);
}

#[tokio::test]
async fn test_truncated_stream_is_network_lost() {
    let backend = Arc::new(ScriptedBackend::new(|_| {
        ScriptedRun::reply("cut off").truncated()
    }));
    let orch = orchestrator(backend, 10);
    orch.start_run(key(), "hi", None).unwrap();

    match settled(&orch).await {
        RunState::Failed { reason, .. } => assert_eq!(reason, FailureReason::NetworkLost),
        other => panic!("unexpected state {:?}", other),
    }
}

#[tokio::test]
async fn test_run_error_is_classified() {
    let backend = Arc::new(ScriptedBackend::new(|_| {
        ScriptedRun::error("token expired", Some("auth_expired"))
    }));
    let orch = orchestrator(backend, 10);
    orch.start_run(key(), "hi", None).unwrap();

    assert_eq!(
        settled(&orch).await,
        RunState::Failed {
            reason: FailureReason::AuthExpired,
            error: "token expired".into(),
        }
    );
}

#[tokio::test]
async fn test_stream_error_is_classified() {
    let backend = Arc::new(ScriptedBackend::new(|_| {
        ScriptedRun::stream_error(BackendError::RateLimited {
            retry_after_ms: 500,
        })
    }));
    let orch = orchestrator(backend, 10);
    orch.start_run(key(), "hi", None).unwrap();

    match settled(&orch).await {
        RunState::Failed { reason, .. } => assert_eq!(reason, FailureReason::RateLimited),
        other => panic!("unexpected state {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_is_sticky_until_reset() {
    let backend = Arc::new(ScriptedBackend::new(|_| {
        ScriptedRun::reply("never finishes").truncated().hanging()
    }));
    let orch = orchestrator(backend, 10);
    orch.start_run(key(), "hi", None).unwrap();

    assert!(orch.cancel_run());
    assert!(!orch.cancel_run());
    assert!(matches!(orch.current_state(), RunState::Cancelled { .. }));
    assert_eq!(
        orch.start_run(key(), "again", None),
        Err(OrchestratorError::AlreadyActive("cancelled"))
    );

    orch.reset();
    assert_eq!(orch.current_state(), RunState::Idle);
    let kept = orch.conversation().expect("conversation kept");
    assert_eq!(kept.messages[0].content, "hi");
}

#[tokio::test]
async fn test_reset_then_restart_appends_to_history() {
    let backend = Arc::new(ScriptedBackend::replying("answer"));
    let orch = orchestrator(backend.clone(), 10);
    orch.start_run(key(), "first", None).unwrap();
    settled(&orch).await;

    orch.reset();
    orch.start_run(key(), "second", None).unwrap();
    match settled(&orch).await {
        RunState::Completed { conversation, .. } => {
            let users: Vec<_> = conversation
                .messages
                .iter()
                .filter(|m| m.role == Role::User)
                .map(|m| m.content.as_str())
                .collect();
            assert_eq!(users, vec!["first", "second"]);
        }
        other => panic!("unexpected state {:?}", other),
    }
}

#[tokio::test]
async fn test_submit_requires_every_pending_output() {
    let backend = Arc::new(ScriptedBackend::sequence(vec![
        ScriptedRun::tool_calls(vec![
            ("a".into(), "one".into(), json!({})),
            ("b".into(), "two".into(), json!({})),
        ]),
        ScriptedRun::reply("done"),
    ]));
    let orch = orchestrator(backend, 10);
    orch.start_run(key(), "go", None).unwrap();

    let pending = match settled(&orch).await {
        RunState::ToolYielding(pending) => pending,
        other => panic!("unexpected state {:?}", other),
    };
    let partial = execute_all(&pending[..1], "ok");
    assert_eq!(
        orch.submit_tool_outputs(partial),
        Err(OrchestratorError::MissingToolOutputs(vec!["b".into()]))
    );
    assert!(matches!(orch.current_state(), RunState::ToolYielding(_)));
}

#[tokio::test]
async fn test_submit_outside_yield_is_rejected() {
    let backend = Arc::new(ScriptedBackend::replying("x"));
    let orch = orchestrator(backend, 10);
    assert_eq!(
        orch.submit_tool_outputs(Vec::new()),
        Err(OrchestratorError::NotYielding("idle"))
    );
}

#[tokio::test]
async fn test_dispose_cancels_and_blocks_further_use() {
    let backend = Arc::new(ScriptedBackend::new(|_| {
        ScriptedRun::new().hanging()
    }));
    let orch = orchestrator(backend, 10);
    orch.start_run(key(), "hi", None).unwrap();
    orch.dispose();

    assert!(matches!(orch.current_state(), RunState::Cancelled { .. }));
    orch.reset();
    assert_eq!(
        orch.start_run(key(), "again", None),
        Err(OrchestratorError::Disposed)
    );
}
