use scriptsandbox::{
    ErrorKind, FnNamespace, HostError, HostRegistry, SandboxConfig, SandboxError, SandboxManager,
    SandboxStatus,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

fn registry() -> HostRegistry {
    let timeline = FnNamespace::new()
        .method("play", |_, _| Ok(json!(true)))
        .method("seek", |args, _| match args.first().and_then(Value::as_f64) {
            Some(t) if t >= 0.0 => Ok(json!(t)),
            _ => Err(HostError::InvalidArguments(
                "seek expects a non-negative time".into(),
            )),
        })
        .method("render", |_, _| {
            std::thread::sleep(Duration::from_millis(300));
            Err(HostError::Failed("render target lost".into()))
        });
    HostRegistry::with_builtins().with("timeline", Arc::new(timeline))
}

fn manager() -> SandboxManager {
    SandboxManager::new(registry())
}

fn log_only(timeout_ms: u64) -> SandboxConfig {
    SandboxConfig::builder()
        .memory_limit_mb(50)
        .timeout_ms(timeout_ms)
        .permit("utils.log")
        .api("utils")
        .build()
}

#[tokio::test]
async fn test_create_returns_active_sandbox() {
    let manager = manager();
    let sandbox = assert_ok!(manager.create_sandbox(log_only(1000)));
    assert_eq!(sandbox.status(), SandboxStatus::Active);
    assert!(manager.get_sandbox(sandbox.id()).is_some());
    assert_eq!(manager.list_sandboxes().len(), 1);
}

#[tokio::test]
async fn test_permission_outside_apis_is_rejected() {
    let manager = manager();
    let config = SandboxConfig::builder()
        .permit("timeline.play")
        .api("utils")
        .build();
    let err = assert_err!(manager.create_sandbox(config));
    assert!(matches!(err, SandboxError::ConfigError(_)));
    assert!(manager.list_sandboxes().is_empty());
}

#[tokio::test]
async fn test_non_positive_limits_are_rejected() {
    let manager = manager();
    let zero_timeout = SandboxConfig {
        timeout_ms: 0,
        ..SandboxConfig::default()
    };
    let zero_memory = SandboxConfig {
        memory_limit_mb: 0,
        ..SandboxConfig::default()
    };
    assert!(matches!(
        manager.create_sandbox(zero_timeout),
        Err(SandboxError::ConfigError(_))
    ));
    assert!(matches!(
        manager.create_sandbox(zero_memory),
        Err(SandboxError::ConfigError(_))
    ));
    assert!(manager.list_sandboxes().is_empty());
}

#[tokio::test]
async fn test_permitted_call_succeeds_with_output() {
    let manager = manager();
    let sandbox = manager.create_sandbox(log_only(1000)).unwrap();

    let result = sandbox
        .execute("api.utils.log('hi')", json!({}))
        .await
        .unwrap();
    assert!(result.success, "{:?}", result.errors);
    assert!(result.errors.is_empty());
    assert!(result.output.contains("hi"));
}

#[tokio::test]
async fn test_denied_call_is_single_permission_error() {
    let manager = manager();
    let sandbox = manager.create_sandbox(log_only(1000)).unwrap();

    let result = sandbox
        .execute("api.sceneGraph.createNode()", json!({}))
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.result, Value::Null);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, ErrorKind::Permission);
    assert!(result.errors[0].message.contains("sceneGraph.createNode"));
}

#[tokio::test]
async fn test_method_level_permission_is_enforced() {
    let manager = manager();
    let sandbox = manager.create_sandbox(log_only(1000)).unwrap();

    let result = sandbox
        .execute("api.utils.now()", json!({}))
        .await
        .unwrap();
    assert_eq!(result.error_kind(), Some(ErrorKind::Permission));
    assert!(result.errors[0].message.contains("utils.now"));
}

#[tokio::test]
async fn test_namespace_wildcard_and_params() {
    let manager = manager();
    let config = SandboxConfig::builder()
        .grant_api("timeline")
        .build();
    let sandbox = manager.create_sandbox(config).unwrap();

    let result = sandbox
        .execute("api.timeline.seek(params.at * 2)", json!({ "at": 1.5 }))
        .await
        .unwrap();
    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.result, json!(3.0));

    let failed = sandbox
        .execute("api.timeline.seek(-1)", json!({}))
        .await
        .unwrap();
    assert_eq!(failed.error_kind(), Some(ErrorKind::Runtime));
}

#[tokio::test]
async fn test_tight_loop_times_out_and_sandbox_stays_usable() {
    let manager = manager();
    let looping = manager.create_sandbox(log_only(50)).unwrap();
    let other = manager.create_sandbox(log_only(1000)).unwrap();

    let started = Instant::now();
    let (timed_out, responsive) = tokio::join!(
        looping.execute("while(true){}", json!({})),
        other.execute("40 + 2", json!({})),
    );
    let timed_out = timed_out.unwrap();
    let responsive = responsive.unwrap();

    assert!(!timed_out.success);
    assert_eq!(timed_out.errors.len(), 1);
    assert_eq!(timed_out.errors[0].kind, ErrorKind::Timeout);
    assert!(timed_out.errors[0].message.contains("50 ms"));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(responsive.result, json!(42));

    let again = looping.execute("1 + 1", json!({})).await.unwrap();
    assert!(again.success);
    assert_eq!(again.result, json!(2));
    assert_eq!(looping.status(), SandboxStatus::Active);
}

#[tokio::test]
async fn test_timeout_wins_over_late_failure() {
    let manager = manager();
    let config = SandboxConfig::builder()
        .timeout_ms(50)
        .grant_api("timeline")
        .build();
    let sandbox = manager.create_sandbox(config).unwrap();

    // The host call outlives the deadline, then fails inside the grace period.
    let result = sandbox
        .execute("api.timeline.render()", json!({}))
        .await
        .unwrap();
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, ErrorKind::Timeout);
    assert!(result.errors[0].message.contains("50 ms"));
}

#[tokio::test]
async fn test_char_literals_and_single_quoted_strings_mix() {
    let manager = manager();
    let sandbox = manager.create_sandbox(log_only(1000)).unwrap();
    let code = "let c = 'x'; api.utils.log('hi'); c";

    let report = sandbox.validate(code);
    assert!(report.valid, "{:?}", report.errors);

    let result = sandbox.execute(code, json!({})).await.unwrap();
    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.result, json!("x"));
    assert!(result.output.contains("hi"));
}

#[tokio::test]
async fn test_api_and_params_inside_functions() {
    let manager = manager();
    let sandbox = manager.create_sandbox(log_only(1000)).unwrap();

    let result = sandbox
        .execute(
            "fn greet(n) { api.utils.log(n) }\nfn twice() { params.x * 2 }\ngreet(\"hi\"); twice()",
            json!({ "x": 21 }),
        )
        .await
        .unwrap();
    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.result, json!(42));
    assert!(result.output.contains("hi"));

    let denied = sandbox
        .execute(
            "fn build() { api.sceneGraph.createNode() }\nbuild()",
            json!({}),
        )
        .await
        .unwrap();
    assert_eq!(denied.errors.len(), 1);
    assert_eq!(denied.errors[0].kind, ErrorKind::Permission);
    assert!(denied.errors[0].message.contains("sceneGraph.createNode"));
}

#[tokio::test]
async fn test_dynamically_named_method_is_denied() {
    let manager = manager();
    let sandbox = manager.create_sandbox(log_only(1000)).unwrap();

    let result = sandbox
        .execute("Fn(\"create\" + \"Node\").call(api.sceneGraph)", json!({}))
        .await
        .unwrap();
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, ErrorKind::Permission);
    assert!(result.errors[0].message.contains("sceneGraph.createNode"));
}

#[tokio::test]
async fn test_invalid_code_is_syntax_error() {
    let manager = manager();
    let sandbox = manager.create_sandbox(log_only(1000)).unwrap();

    let result = sandbox
        .execute("let x = ;\nx +", json!({}))
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, ErrorKind::Syntax);
    assert_eq!(result.errors[0].line, Some(1));
}

#[tokio::test]
async fn test_thrown_value_is_runtime_error() {
    let manager = manager();
    let sandbox = manager.create_sandbox(log_only(1000)).unwrap();

    let result = sandbox
        .execute("print(\"before\"); throw \"boom\"", json!({}))
        .await
        .unwrap();
    assert_eq!(result.error_kind(), Some(ErrorKind::Runtime));
    assert!(result.errors[0].message.contains("boom"));
    assert_eq!(result.output, "before\n");
}

#[tokio::test]
async fn test_data_quota_is_memory_error() {
    let manager = manager();
    let config = SandboxConfig::builder()
        .memory_limit_mb(1)
        .permit("utils")
        .api("utils")
        .build();
    let sandbox = manager.create_sandbox(config).unwrap();

    let result = sandbox
        .execute(
            "let s = \"0123456789abcdef\"; for i in 0..20 { s = s + s; } s.len()",
            json!({}),
        )
        .await
        .unwrap();
    assert_eq!(result.error_kind(), Some(ErrorKind::Memory));
}

#[tokio::test]
async fn test_destroy_unknown_and_twice() {
    let manager = manager();
    assert!(!manager.destroy_sandbox("sbx-404").await);

    let sandbox = manager.create_sandbox(log_only(1000)).unwrap();
    let id = sandbox.id().to_string();
    assert!(manager.destroy_sandbox(&id).await);
    assert!(!manager.destroy_sandbox(&id).await);
    assert!(manager.get_sandbox(&id).is_none());
    assert_eq!(sandbox.status(), SandboxStatus::Destroyed);
}

#[tokio::test]
async fn test_execute_after_destroy_fails() {
    let manager = manager();
    let sandbox = manager.create_sandbox(log_only(1000)).unwrap();
    manager.destroy_sandbox(sandbox.id()).await;

    let err = tokio::time::timeout(Duration::from_secs(1), sandbox.execute("1", json!({})))
        .await
        .expect("execute on a destroyed sandbox must not hang");
    assert!(matches!(err, Err(SandboxError::Destroyed(_))));
}

#[tokio::test]
async fn test_destroy_cancels_in_flight_execution() {
    let manager = manager();
    let sandbox = manager.create_sandbox(log_only(30_000)).unwrap();

    let running = {
        let sandbox = Arc::clone(&sandbox);
        tokio::spawn(async move { sandbox.execute("loop { }", json!({})).await })
    };
    let queued = {
        let sandbox = Arc::clone(&sandbox);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sandbox.execute("1", json!({})).await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    assert!(manager.destroy_sandbox(sandbox.id()).await);
    assert!(started.elapsed() < Duration::from_secs(5));

    let cancelled = running.await.unwrap().unwrap();
    assert!(!cancelled.success);
    assert_eq!(cancelled.errors.len(), 1);
    assert_eq!(cancelled.errors[0].kind, ErrorKind::Runtime);
    assert!(cancelled.errors[0].message.contains("cancelled"));

    assert!(matches!(
        queued.await.unwrap(),
        Err(SandboxError::Destroyed(_))
    ));
}

#[tokio::test]
async fn test_concurrent_executions_complete_in_order() {
    let finished = Arc::new(AtomicUsize::new(0));
    let order = Arc::clone(&finished);
    let counter = FnNamespace::new().method("tick", move |_, _| {
        Ok(json!(order.fetch_add(1, Ordering::SeqCst)))
    });
    let manager = SandboxManager::new(HostRegistry::with_builtins().with("counter", Arc::new(counter)));
    let sandbox = manager
        .create_sandbox(SandboxConfig::builder().grant_api("counter").build())
        .unwrap();

    let slow = "let n = 0; for i in 0..20000 { n += i; } api.counter.tick()";
    let (first, second, third) = tokio::join!(
        sandbox.execute(slow, json!({})),
        sandbox.execute("api.counter.tick()", json!({})),
        sandbox.execute("api.counter.tick()", json!({})),
    );
    assert_eq!(first.unwrap().result, json!(0));
    assert_eq!(second.unwrap().result, json!(1));
    assert_eq!(third.unwrap().result, json!(2));
    assert_eq!(finished.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_stats_track_history() {
    let manager = manager();
    let sandbox = manager.create_sandbox(log_only(1000)).unwrap();

    sandbox.execute("1", json!({})).await.unwrap();
    sandbox.execute("2", json!({})).await.unwrap();
    sandbox
        .execute("api.timeline.play()", json!({}))
        .await
        .unwrap();

    let stats = sandbox.stats();
    assert_eq!(stats.total_executions, 3);
    assert_eq!(stats.successful_executions, 2);
    assert_eq!(stats.failed_executions, 1);
    assert!(stats.average_execution_time_ms >= 0.0);
    assert_eq!(
        stats.last_error.map(|e| e.kind),
        Some(ErrorKind::Permission)
    );
    assert_eq!(sandbox.execution_count(), 3);
    assert_eq!(sandbox.error_count(), 1);
}

#[tokio::test]
async fn test_validate_never_executes() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let counter = FnNamespace::new().method("hit", move |_, _| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Null)
    });
    let manager = SandboxManager::new(HostRegistry::with_builtins().with("counter", Arc::new(counter)));
    let sandbox = manager
        .create_sandbox(
            SandboxConfig::builder()
                .grant_api("counter")
                .permit("utils.log")
                .api("utils")
                .build(),
        )
        .unwrap();

    let report = sandbox.validate("api.counter.hit(); api.utils.now(); while true { }");
    assert!(report.valid);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(sandbox.stats().total_executions, 0);
    assert!(report.warnings.iter().any(|w| w.message.contains("utils.now")));
    assert!(report.warnings.iter().any(|w| w.message.contains("timeout")));
    assert!(!report.suggestions.is_empty());

    let broken = sandbox.validate("let = 5;");
    assert!(!broken.valid);
    assert_eq!(broken.errors[0].kind, ErrorKind::Syntax);
}

#[tokio::test]
async fn test_info_serializes_for_ui() {
    let manager = manager();
    let sandbox = manager
        .create_sandbox(
            SandboxConfig::builder()
                .name("timeline-helper")
                .permit("utils.log")
                .api("utils")
                .build(),
        )
        .unwrap();

    let info = serde_json::to_value(sandbox.info()).unwrap();
    assert_eq!(info["name"], json!("timeline-helper"));
    assert_eq!(info["status"], json!("active"));
    assert_eq!(info["config"]["timeoutMs"], json!(5000));
    assert_eq!(info["executionCount"], json!(0));
}
