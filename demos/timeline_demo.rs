use parking_lot::Mutex;
use scriptsandbox::{FnNamespace, HostError, HostRegistry, SandboxConfig, SandboxManager};
use serde_json::{json, Value};
use std::sync::Arc;

/// Stand-in for the editor's timeline model.
#[derive(Debug, Default)]
struct Timeline {
    playhead: f64,
    playing: bool,
}

fn timeline_api(timeline: Arc<Mutex<Timeline>>) -> FnNamespace {
    let play = Arc::clone(&timeline);
    let seek = Arc::clone(&timeline);
    let read = timeline;
    FnNamespace::new()
        .method("play", move |_, ctx| {
            play.lock().playing = true;
            ctx.log("timeline: playing");
            Ok(Value::Null)
        })
        .method("seek", move |args, _| {
            let t = args
                .first()
                .and_then(Value::as_f64)
                .ok_or_else(|| HostError::InvalidArguments("seek(time) needs a number".into()))?;
            seek.lock().playhead = t.max(0.0);
            Ok(json!(t.max(0.0)))
        })
        .method("position", move |_, _| Ok(json!(read.lock().playhead)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "scriptsandbox=info".to_string()),
        )
        .with_target(false)
        .init();

    println!("=== Script Sandbox Timeline Demo ===\n");

    let timeline = Arc::new(Mutex::new(Timeline::default()));
    let registry = HostRegistry::with_builtins()
        .with("timeline", Arc::new(timeline_api(Arc::clone(&timeline))));
    let manager = SandboxManager::new(registry);

    let sandbox = manager.create_sandbox(
        SandboxConfig::builder()
            .name("timeline-helper")
            .timeout_ms(1000)
            .grant_api("timeline")
            .permit("utils.log")
            .api("utils")
            .build(),
    )?;
    println!(
        "Created {} ({}, security level: {}/10)\n",
        sandbox.id(),
        sandbox.capabilities().name,
        sandbox.capabilities().security_level
    );

    // Example 1: permitted calls
    println!("Example 1: Seek and play");
    let code1 = r#"
        let target = params.fps * params.seconds;
        api.timeline.seek(target);
        api.timeline.play();
        api.utils.log(`moved to frame ${target}`);
        api.timeline.position()
    "#;
    let result = sandbox.execute(code1, json!({ "fps": 24, "seconds": 2 })).await?;
    println!("{}\n", serde_json::to_string_pretty(&result)?);
    println!("Host timeline is now {:?}\n", timeline.lock());

    // Example 2: denied call
    println!("Example 2: Calling an api the sandbox was not granted");
    let result = sandbox.execute("api.sceneGraph.createNode(\"box\")", json!({})).await?;
    println!("{}\n", serde_json::to_string_pretty(&result)?);

    // Example 3: runaway loop
    println!("Example 3: Runaway loop is stopped at the timeout");
    let code3 = "let frames = 0; while true { frames += 1; }";
    let report = sandbox.validate(code3);
    for warning in &report.warnings {
        println!("  validate: {}", warning.message);
    }
    let result = sandbox.execute(code3, json!({})).await?;
    println!("{}\n", serde_json::to_string_pretty(&result)?);

    println!("Stats: {}", serde_json::to_string_pretty(&sandbox.stats())?);
    manager.shutdown().await;
    println!("Manager: {}", serde_json::to_string_pretty(&manager.stats())?);
    Ok(())
}
