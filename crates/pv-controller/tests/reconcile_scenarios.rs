//! Reconciliation against an existing controller

use pv_controller::Reconciler;
use pv_core::inventory::{parse_snapshot, HostEntry};
use pv_core::manifest::parse_manifest;
use pv_core::{ControllerRecord, InMemoryCluster, PodInfo, PodPhase};

const MANIFEST: &str = r#"
metadata:
  name: workers
spec:
  replicas: 1
  template:
    spec:
      containers:
        - env:
            - name: PV_COMMAND
              value: /opt/app/run.sh
"#;

fn hosts(names: &[&str]) -> Vec<HostEntry> {
    names
        .iter()
        .map(|name| HostEntry {
            user: "deploy".to_string(),
            ..HostEntry::new(*name)
        })
        .collect()
}

#[tokio::test]
async fn test_removed_host_deletes_exactly_its_pod() {
    let cluster = InMemoryCluster::new("default");
    let mut record = ControllerRecord::new("workers");
    record.replicas = Some(3);
    record.set_claim("a", "p1");
    record.set_claim("b", "p2");
    record.set_claim("c", "p3");
    cluster.insert_controller(record).await;
    for pod in ["p1", "p2", "p3"] {
        cluster.add_pod(PodInfo::running(pod)).await;
    }

    let manifest = parse_manifest(MANIFEST).unwrap();
    let stored = Reconciler::new(cluster.clone())
        .reconcile("appservers", hosts(&["a", "c"]), &manifest, None)
        .await
        .unwrap();

    assert_eq!(cluster.deleted_pods().await, vec!["p2".to_string()]);
    assert_eq!(stored.claim_owner("b"), None);
    assert_eq!(stored.claim_owner("a"), Some("p1"));
    assert_eq!(stored.claim_owner("c"), Some("p3"));
    assert_eq!(parse_snapshot(stored.inventory_text().unwrap()), hosts(&["a", "c"]));
}

#[tokio::test]
async fn test_removed_host_with_dead_owner_only_drops_claim() {
    let cluster = InMemoryCluster::new("default");
    let mut record = ControllerRecord::new("workers");
    record.set_claim("b", "p2");
    cluster.insert_controller(record).await;
    cluster.add_pod(PodInfo::running("p2")).await;
    cluster.set_pod_phase("p2", PodPhase::Failed).await;

    let manifest = parse_manifest(MANIFEST).unwrap();
    let stored = Reconciler::new(cluster.clone())
        .reconcile("appservers", hosts(&["a"]), &manifest, None)
        .await
        .unwrap();

    assert!(cluster.deleted_pods().await.is_empty());
    assert!(stored.claims().is_empty());
}

#[tokio::test]
async fn test_unspecified_replicas_keep_stored_count() {
    let cluster = InMemoryCluster::new("default");
    let mut record = ControllerRecord::new("workers");
    record.replicas = Some(7);
    cluster.insert_controller(record).await;

    let manifest = parse_manifest(MANIFEST).unwrap();
    let stored = Reconciler::new(cluster.clone())
        .reconcile("appservers", hosts(&["a"]), &manifest, None)
        .await
        .unwrap();
    assert_eq!(stored.replicas, Some(7));
    assert_eq!(cluster.controller("workers").await.unwrap().replicas, Some(7));
}

#[tokio::test]
async fn test_existing_annotations_survive() {
    let cluster = InMemoryCluster::new("default");
    let mut record = ControllerRecord::new("workers");
    record.set_session_id("a", "shell-1");
    record
        .annotations
        .insert("example.com/owner".to_string(), "ops".to_string());
    cluster.insert_controller(record).await;

    let manifest = parse_manifest(MANIFEST).unwrap();
    let stored = Reconciler::new(cluster.clone())
        .reconcile("appservers", hosts(&["a"]), &manifest, None)
        .await
        .unwrap();
    assert_eq!(stored.session_id("a"), Some("shell-1"));
    assert_eq!(
        stored.annotations.get("example.com/owner").map(String::as_str),
        Some("ops")
    );
}
