//! File pipeline over a real Zenoh session.
//!
//! Note: Zenoh requires multi-thread tokio runtime.

use std::sync::Arc;
use std::time::Duration;

use filebridge_framework::{BridgeConfig, ZenohBroker};
use zenoh_bridge_file::{FileBridgeConfig, MockSink, PipelineState, build_pipeline_with_sink};

fn unique_prefix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("test_file_{}", nanos)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hello_world_over_zenoh() {
    let dir = tempfile::tempdir().unwrap();
    let watched = serde_json::to_string(&dir.path().display().to_string()).unwrap();
    let config = FileBridgeConfig::parse(&format!(
        r#"{{
            key_prefix: "{prefix}",
            serialization: "cbor",
            file: {{ dir: {watched}, poll_interval_ms: 100 }},
            transform: "uppercase",
        }}"#,
        prefix = unique_prefix(),
    ))
    .unwrap();

    let broker = Arc::new(
        ZenohBroker::new(config.zenoh().clone(), config.key_prefix())
            .with_format(config.serialization()),
    );
    let sink = Arc::new(MockSink::new("output"));
    sink.expect_bodies(["HELLO WORLD!"]);

    let mut pipeline = build_pipeline_with_sink(&config, broker.clone(), sink.clone()).unwrap();
    pipeline.start().await.unwrap();
    assert!(broker.session().await.is_some());

    // Give subscriber time to set up
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::write(dir.path().join("hello.txt"), "Hello World!").unwrap();

    sink.assert_satisfied(Duration::from_secs(5)).await.unwrap();

    pipeline.stop().await.unwrap();
    assert_eq!(pipeline.status(), PipelineState::Stopped);
    assert!(broker.session().await.is_none());
}
