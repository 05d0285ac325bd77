mod common;

use agent_bridge::agents::{
    AgentResult, AgentRuntime, FailureReason, RuntimeConfig, RuntimeError, ScriptedBackend,
    ScriptedRun, SpawnOptions, SubAgentPool, ToolRegistryResolver,
};
use agent_bridge::bridge::{sub_agent_functions, BridgeCache, BridgeConfig, HostInstaller};
use agent_bridge::domain::{PlatformConstraints, ThreadKey};
use agent_bridge::tools::{ClientTool, RunCodeTool, ToolRegistry};
use async_trait::async_trait;
use common::{delayed_echo, eventually, last_tool_output, runtime, runtime_with};
use serde_json::json;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

#[tokio::test]
async fn test_wait_all_keeps_input_order() {
    let backend = Arc::new(delayed_echo(&[("A", 60), ("B", 10), ("C", 30)]));
    let runtime = runtime(backend, ToolRegistry::new());

    let mut sessions = Vec::new();
    for prompt in ["A", "B", "C"] {
        sessions.push(
            runtime
                .spawn("room", prompt, SpawnOptions::default())
                .await
                .unwrap(),
        );
    }

    let results = runtime.wait_all(&sessions, None).await;
    let outputs: Vec<_> = results.iter().map(|r| r.output().unwrap()).collect();
    assert_eq!(outputs, vec!["A", "B", "C"]);
    for (session, result) in sessions.iter().zip(&results) {
        assert_eq!(result.thread_key(), session.thread_key());
    }
}

#[tokio::test]
async fn test_wait_any_returns_first_finisher() {
    let backend = Arc::new(delayed_echo(&[("slow", 200), ("fast", 10)]));
    let runtime = runtime(backend, ToolRegistry::new());

    let sessions = vec![
        runtime
            .spawn("room", "slow", SpawnOptions::default())
            .await
            .unwrap(),
        runtime
            .spawn("room", "fast", SpawnOptions::default())
            .await
            .unwrap(),
    ];

    let (index, result) = runtime.wait_any(&sessions, None).await.unwrap();
    assert_eq!(index, 1);
    assert_eq!(result.output(), Some("fast"));
}

#[tokio::test]
async fn test_wait_any_times_out() {
    let backend = Arc::new(ScriptedBackend::new(|_| {
        ScriptedRun::reply("never").truncated().hanging()
    }));
    let runtime = runtime(backend, ToolRegistry::new());

    let sessions = vec![runtime
        .spawn("room", "go", SpawnOptions::default())
        .await
        .unwrap()];
    assert!(runtime
        .wait_any(&sessions, Some(Duration::from_millis(20)))
        .await
        .is_none());
    assert!(runtime.wait_any(&[], None).await.is_none());
}

#[tokio::test]
async fn test_wait_all_with_timeout_mixes_results() {
    let backend = Arc::new(ScriptedBackend::new(|ctx| match ctx.prompt() {
        Some("quick") => ScriptedRun::reply("done"),
        _ => ScriptedRun::reply("never").truncated().hanging(),
    }));
    let runtime = runtime(backend, ToolRegistry::new());

    let sessions = vec![
        runtime
            .spawn("room", "quick", SpawnOptions::default())
            .await
            .unwrap(),
        runtime
            .spawn("room", "stuck", SpawnOptions::default())
            .await
            .unwrap(),
    ];
    let results = runtime
        .wait_all(&sessions, Some(Duration::from_millis(100)))
        .await;
    assert!(results[0].is_success());
    assert!(matches!(results[1], AgentResult::TimedOut { .. }));

    runtime.cancel_all(&sessions);
    assert_eq!(
        sessions[1].result().await.failure_reason(),
        Some(FailureReason::Cancelled)
    );
    assert!(sessions[0].result().await.is_success());
}

#[tokio::test]
async fn test_ephemeral_thread_is_deleted() {
    let backend = Arc::new(ScriptedBackend::replying("bye"));
    let runtime = runtime(backend.clone(), ToolRegistry::new());

    let session = runtime
        .spawn("room", "go", SpawnOptions::ephemeral())
        .await
        .unwrap();
    assert!(session.result().await.is_success());

    let key = session.thread_key().clone();
    assert!(eventually(|| backend.deleted_threads().contains(&key)).await);
}

#[tokio::test]
async fn test_ephemeral_delete_failure_keeps_result() {
    let backend = Arc::new(ScriptedBackend::replying("bye"));
    backend.fail_deletes(true);
    let runtime = runtime(backend.clone(), ToolRegistry::new());

    let session = runtime
        .spawn("room", "go", SpawnOptions::ephemeral())
        .await
        .unwrap();
    assert_eq!(session.result().await.output(), Some("bye"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(backend.deleted_threads().is_empty());
    assert!(session.try_result().unwrap().is_success());
}

#[tokio::test]
async fn test_persistent_thread_is_kept() {
    let backend = Arc::new(ScriptedBackend::replying("hi"));
    let runtime = runtime(backend.clone(), ToolRegistry::new());

    let session = runtime
        .spawn("room", "go", SpawnOptions::default())
        .await
        .unwrap();
    session.result().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(backend.deleted_threads().is_empty());
}

#[tokio::test]
async fn test_thread_keys_use_server_id() {
    let backend = Arc::new(ScriptedBackend::replying("hi"));
    let config = RuntimeConfig {
        server_id: "edge-7".to_string(),
        ..Default::default()
    };
    let runtime = runtime_with(backend, ToolRegistry::new(), config);

    let session = runtime
        .spawn("lobby", "go", SpawnOptions::default())
        .await
        .unwrap();
    let key = session.thread_key();
    assert_eq!(key.server_id, "edge-7");
    assert_eq!(key.room_id, "lobby");
}

struct NoTools;

#[async_trait]
impl ToolRegistryResolver for NoTools {
    async fn resolve(&self, room_id: &str) -> anyhow::Result<ToolRegistry> {
        anyhow::bail!("room {} is closed", room_id)
    }
}

#[tokio::test]
async fn test_tool_resolution_failure() {
    let backend = Arc::new(ScriptedBackend::replying("hi"));
    let runtime = AgentRuntime::new(
        backend.clone(),
        Arc::new(NoTools),
        RuntimeConfig::default(),
        PlatformConstraints::default(),
    );

    let err = runtime
        .spawn("attic", "go", SpawnOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::ToolResolution { ref room_id, .. } if room_id == "attic"));
    assert_eq!(backend.create_run_count(), 0);
}

#[tokio::test]
async fn test_script_drives_sub_agents() {
    let backend = Arc::new(ScriptedBackend::new(|ctx| {
        ScriptedRun::reply(ctx.prompt().unwrap_or_default().to_uppercase())
    }));
    let runtime = Arc::new(runtime(backend.clone(), ToolRegistry::new()));
    let pool = Arc::new(SubAgentPool::new(runtime, "room"));

    let cache = BridgeCache::new(BridgeConfig::default(), PlatformConstraints::default());
    let bridge = cache
        .acquire(&ThreadKey::new("local", "room", "parent"))
        .await
        .unwrap();
    for function in sub_agent_functions(pool.clone()) {
        bridge.register(function);
    }

    let outcome = bridge
        .execute(
            "local a = spawn_agent('alpha')\n\
             local b = spawn_agent('beta')\n\
             local ra = await_agent(a)\n\
             local rb = await_agent(b, 1000)\n\
             return {ra.output, rb.output, ra.status}",
        )
        .collect()
        .await;
    assert_eq!(outcome.value, Some(json!(["ALPHA", "BETA", "success"])));
    assert!(pool.is_empty());
    assert!(eventually(|| backend.deleted_threads().len() == 2).await);
}

#[tokio::test]
async fn test_script_spawned_agent_uses_tools_on_serial_platform() {
    let backend = Arc::new(ScriptedBackend::new(|ctx| match (ctx.prompt(), ctx.run_index) {
        (Some("parent"), 0) => ScriptedRun::tool_call(
            "call_1",
            "run_code",
            json!({"code": "local h = spawn_agent('child')\nreturn await_agent(h, 3000).status"}),
        ),
        (Some("child"), 0) => ScriptedRun::tool_call("call_1", "echo", json!({"text": "ping"})),
        _ => ScriptedRun::reply(last_tool_output(ctx).unwrap_or_default()),
    }));
    let serial = PlatformConstraints {
        supports_parallel_execution: false,
        ..PlatformConstraints::default()
    };

    let pool: Arc<OnceLock<Arc<SubAgentPool>>> = Arc::new(OnceLock::new());
    let installer: HostInstaller = {
        let pool = pool.clone();
        Arc::new(move |_: &ThreadKey| match pool.get() {
            Some(pool) => sub_agent_functions(pool.clone()),
            None => Vec::new(),
        })
    };
    let cache = BridgeCache::with_installer(BridgeConfig::default(), serial, installer);
    let tools = ToolRegistry::new()
        .register(RunCodeTool::new(cache).into_client_tool())
        .register(ClientTool::from_fn(
            "echo",
            "Echo input",
            json!({"type": "object"}),
            |args, _| async move { Ok(args["text"].as_str().unwrap_or_default().to_string()) },
        ));
    let runtime = Arc::new(AgentRuntime::new(
        backend.clone(),
        Arc::new(tools),
        RuntimeConfig::default(),
        serial,
    ));
    assert!(pool
        .set(Arc::new(SubAgentPool::new(runtime.clone(), "room")))
        .is_ok());

    let session = runtime
        .spawn("room", "parent", SpawnOptions::default())
        .await
        .unwrap();
    let result = session.await_result(Some(Duration::from_secs(10))).await;
    let summary: serde_json::Value = serde_json::from_str(result.output().unwrap()).unwrap();
    assert_eq!(summary["result"], json!("success"));
    assert_eq!(summary["error"], serde_json::Value::Null);
    assert_eq!(backend.create_run_count(), 4);
}
