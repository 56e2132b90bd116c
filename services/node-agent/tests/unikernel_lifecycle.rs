//! Integration tests: unikernel backend lifecycle.
//!
//! Drives the backend through a scripted control tool and checks the
//! resulting identity map and status registry contents:
//! - start output grammar (started, already running, malformed)
//! - stop output grammar and identity removal
//! - memory admission before any process is spawned
//! - per-id serialization of lifecycle operations

use std::sync::Arc;

use fognode_node_agent::command::ScriptedRunner;
use fognode_node_agent::resources::{FixedMemoryProbe, MIB};
use fognode_node_agent::unikernel::{UnikernelBackend, UnikernelConfig};
use fognode_node_agent::{
    AgentError, OperationContext, StatusRegistry, WorkloadBackend, WorkloadIdentity,
    WorkloadState,
};

const STARTED: &str = "2017/05/28 20:22:24 Application unikernel started: true, IP: 192.168.122.89, Info: Successful start";
const ALREADY_RUNNING: &str = "2017/05/28 20:23:10 Application unikernel started: false, IP: , Info: HelloWorldApp is already running. Please choose a different name, or stop it first";
const STOPPED: &str = "2017/05/28 20:25:02 Application unikernel stopped: true, Info: Successfully stopped Application (HelloWorldApp)";

struct Node {
    _images: tempfile::TempDir,
    runner: Arc<ScriptedRunner>,
    status: Arc<StatusRegistry>,
    backend: Arc<UnikernelBackend>,
}

fn node_with_memory(total: u64, reserved: u64) -> Node {
    let images = tempfile::tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new());
    let status = Arc::new(StatusRegistry::new());
    let backend = UnikernelBackend::new(
        UnikernelConfig {
            control_tool: "ukdctl".to_string(),
            image_location: images.path().to_path_buf(),
        },
        runner.clone(),
        Arc::new(FixedMemoryProbe::new(total, reserved)),
        status.clone(),
    )
    .unwrap();

    Node {
        _images: images,
        runner,
        status,
        backend: Arc::new(backend),
    }
}

fn node() -> Node {
    node_with_memory(4 * 1024 * MIB, 256 * MIB)
}

async fn register_hello(node: &Node) {
    node.backend
        .register(WorkloadIdentity::new("HelloWorldApp", "aarch64-loader.img"))
        .await;
}

#[tokio::test]
async fn test_start_records_address_and_running_state() {
    let node = node();
    register_hello(&node).await;
    node.runner.push_output(0, "", STARTED);

    let status = node
        .backend
        .start("HelloWorldApp", &OperationContext::default())
        .await
        .unwrap();

    assert_eq!(status.state, WorkloadState::Running);
    assert!(status.start_time > 0);
    let identity = node.backend.identities().get("HelloWorldApp").unwrap();
    assert_eq!(identity.ip_address, "192.168.122.89");
}

#[tokio::test]
async fn test_already_running_is_idempotent() {
    let node = node();
    register_hello(&node).await;
    let ctx = OperationContext::default();

    node.runner.push_output(0, "", STARTED);
    let first = node.backend.start("HelloWorldApp", &ctx).await.unwrap();

    node.runner.push_output(0, "", ALREADY_RUNNING);
    let second = node.backend.start("HelloWorldApp", &ctx).await.unwrap();

    assert_eq!(second.state, WorkloadState::Running);
    assert_eq!(second.start_time, first.start_time);
    assert_eq!(
        node.backend.identities().get("HelloWorldApp").unwrap().ip_address,
        "192.168.122.89"
    );
}

#[tokio::test]
async fn test_short_start_output_is_parse_error() {
    let node = node();
    register_hello(&node).await;
    let raw = "Application unikernel started: true, IP: 192.168.122.89";
    node.runner.push_output(0, "", raw);

    let err = node
        .backend
        .start("HelloWorldApp", &OperationContext::default())
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::Parse { .. }));
    assert_eq!(err.raw_output(), Some(raw));
    assert_eq!(
        node.status.get_or_create_workload("HelloWorldApp").state,
        WorkloadState::Failed
    );
}

#[tokio::test]
async fn test_confirmed_stop_removes_identity() {
    let node = node();
    register_hello(&node).await;
    let ctx = OperationContext::default();

    node.runner.push_output(0, "", STARTED);
    node.backend.start("HelloWorldApp", &ctx).await.unwrap();

    node.runner.push_output(0, "", STOPPED);
    node.backend.stop("HelloWorldApp", &ctx).await.unwrap();

    assert!(!node.backend.identities().contains("HelloWorldApp"));
    let status = node.status.get_or_create_workload("HelloWorldApp");
    assert_eq!(status.state, WorkloadState::Stopped);
    assert_eq!(status.operating_duration(), 0);

    // Stopping again needs a fresh registration.
    let err = node.backend.stop("HelloWorldApp", &ctx).await.unwrap_err();
    assert!(err.is_config());
}

#[tokio::test]
async fn test_resource_rejection_spawns_nothing() {
    // 1 GiB host: 256 MiB required, 200 MiB left.
    let node = node_with_memory(1024 * MIB, 824 * MIB);
    register_hello(&node).await;

    let err = node
        .backend
        .start("HelloWorldApp", &OperationContext::default())
        .await
        .unwrap_err();

    match err {
        AgentError::Resource {
            required,
            available,
        } => {
            assert_eq!(required, 256 * MIB);
            assert_eq!(available, 200 * MIB);
        }
        other => panic!("expected resource error, got {other:?}"),
    }
    assert_eq!(node.runner.invocation_count(), 0);
    assert_eq!(
        node.status.get_or_create_workload("HelloWorldApp").state,
        WorkloadState::Stopped
    );
}

#[tokio::test]
async fn test_cancelled_context_fails_start() {
    let node = node();
    register_hello(&node).await;
    let ctx = OperationContext::default();
    ctx.cancel();

    let err = node.backend.start("HelloWorldApp", &ctx).await.unwrap_err();
    assert!(err.is_execution());
    assert_eq!(
        node.status.get_or_create_workload("HelloWorldApp").state,
        WorkloadState::Failed
    );
}

#[tokio::test]
async fn test_concurrent_start_and_stop_on_one_id() {
    let node = node();
    register_hello(&node).await;
    node.runner.push_output(0, "", STARTED);
    node.runner.push_output(0, "", STOPPED);
    let ctx = OperationContext::default();

    let guard = node.backend.identities().lock("HelloWorldApp").await;

    let start = tokio::spawn({
        let backend = Arc::clone(&node.backend);
        let ctx = ctx.clone();
        async move { backend.start("HelloWorldApp", &ctx).await }
    });
    tokio::task::yield_now().await;
    assert_eq!(node.runner.invocation_count(), 0);

    drop(guard);
    start.await.unwrap().unwrap();

    node.backend.stop("HelloWorldApp", &ctx).await.unwrap();
    assert_eq!(node.runner.invocation_count(), 2);
    assert_eq!(node.runner.pending(), 0);
    assert!(node.backend.identities().is_empty());
}

#[tokio::test]
async fn test_list_reports_running_workloads_only() {
    let node = node();
    let ctx = OperationContext::default();
    for id in ["a", "b", "c"] {
        node.backend
            .register(WorkloadIdentity::new(id, format!("{id}.img")))
            .await;
    }

    node.runner.push_output(0, "", STARTED);
    node.backend.start("a", &ctx).await.unwrap();
    node.runner.push_output(0, "", STARTED);
    node.backend.start("c", &ctx).await.unwrap();
    node.runner.push_output(0, "", STOPPED);
    node.backend.stop("c", &ctx).await.unwrap();

    let listed = node.backend.list(&ctx).await.unwrap();
    let ids: Vec<_> = listed.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["a"]);
    assert_eq!(listed[0].state, WorkloadState::Running);
    assert_eq!(listed[0].address.as_deref(), Some("192.168.122.89"));
}
