//! Integration tests: status registry reporting.
//!
//! Tests verify what the status-reporting API reads from the registry:
//! - every queried workload has an entry, defaulting to STOPPED
//! - JSON rendering of workloads and registries
//! - concurrent writers on both maps

use std::sync::Arc;

use fognode_node_agent::status::{format_fixed2, BackendHealth, LinkStatus};
use fognode_node_agent::{StatusRegistry, WorkloadState, WorkloadStatus};
use serde_json::Value;

#[test]
fn test_get_or_create_is_idempotent() {
    let registry = StatusRegistry::new();

    for _ in 0..3 {
        let status = registry.get_or_create_workload("never-started");
        assert_eq!(status.state, WorkloadState::Stopped);
        assert_eq!(status.start_time, 0);
    }

    assert_eq!(registry.workload_ids(), vec!["never-started".to_string()]);
}

#[test]
fn test_workloads_json() {
    let registry = StatusRegistry::new();
    registry.set_workload(
        "web",
        WorkloadStatus {
            state: WorkloadState::Running,
            start_time: 1_000,
            cpu_usage: 12.345,
            memory_usage: 52_428_800,
        },
    );
    registry.get_or_create_workload("batch");

    let rendered = registry.render_workloads_json_at(61_000);
    let rows: Value = serde_json::from_str(&rendered).unwrap();
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 2);

    assert_eq!(rows[0]["id"], "batch");
    assert_eq!(rows[0]["status"], "STOPPED");
    assert_eq!(rows[0]["operatingduration"], 0);
    assert_eq!(rows[0]["cpuusage"], "0.00");

    assert_eq!(rows[1]["id"], "web");
    assert_eq!(rows[1]["status"], "RUNNING");
    assert_eq!(rows[1]["starttime"], 1_000);
    assert_eq!(rows[1]["operatingduration"], 60_000);
    assert_eq!(rows[1]["cpuusage"], "12.35");
    assert_eq!(rows[1]["memoryusage"], "52428800");
}

#[test]
fn test_registries_json_and_upsert() {
    let registry = StatusRegistry::new();
    assert_eq!(registry.registry_link("hub.example"), None);

    registry.set_registry_link("hub.example", LinkStatus::Unknown);
    registry.set_registry_link("cache.local", LinkStatus::Ok);
    registry.set_registry_link("hub.example", LinkStatus::Broken);

    assert_eq!(registry.registries_count(), 2);
    assert_eq!(
        registry.render_registries_json(),
        r#"[{"linkstatus":"OK","url":"cache.local"},{"linkstatus":"BROKEN","url":"hub.example"}]"#
    );
}

#[test]
fn test_empty_registry_renders_empty_arrays() {
    let registry = StatusRegistry::new();
    assert_eq!(registry.render_workloads_json(), "[]");
    assert_eq!(registry.render_registries_json(), "[]");
    assert_eq!(registry.backend_health(), BackendHealth::Running);
}

#[test]
fn test_fixed_two_decimals() {
    assert_eq!(format_fixed2(12.345), "12.35");
    assert_eq!(format_fixed2(0.005), "0.01");
    assert_eq!(format_fixed2(99.999), "100.00");
    assert_eq!(format_fixed2(7.0), "7.00");
}

#[test]
fn test_remove_workload() {
    let registry = StatusRegistry::new();
    registry.get_or_create_workload("web");
    assert!(registry.remove_workload("web").is_some());
    assert!(registry.remove_workload("web").is_none());
    assert_eq!(registry.render_workloads_json(), "[]");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers() {
    let registry = Arc::new(StatusRegistry::new());

    let mut handles = Vec::new();
    for worker in 0..8 {
        let registry = Arc::clone(&registry);
        handles.push(tokio::spawn(async move {
            for i in 0..50 {
                registry.update_workload(&format!("w{}", i % 10), |status| {
                    status.memory_usage += 1;
                });
                registry.set_registry_link(&format!("r{worker}"), LinkStatus::Ok);
                registry.set_running_count(i);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let total: u64 = registry
        .workload_ids()
        .iter()
        .map(|id| registry.get_or_create_workload(id).memory_usage)
        .sum();
    assert_eq!(total, 8 * 50);
    assert_eq!(registry.workload_ids().len(), 10);
    assert_eq!(registry.registries_count(), 8);
}
