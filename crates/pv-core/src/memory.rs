//! In-memory cluster backend

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::ClusterError;
use crate::traits::Cluster;
use crate::types::{ControllerRecord, PodInfo, PodPhase, SecretSpec};

#[derive(Default)]
struct State {
    controllers: BTreeMap<String, ControllerRecord>,
    pods: BTreeMap<String, PodInfo>,
    secrets: BTreeMap<String, SecretSpec>,
    deleted_pods: Vec<String>,
    version: u64,
    controller_writes: usize,
    pending_conflicts: u32,
    pending_read_failures: u32,
    fail_pod_annotations: bool,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// Versioned in-memory [`Cluster`] for tests and local runs.
///
/// Controller writes are checked against the stored `resource_version`
/// exactly like the real API server, so concurrent lease attempts observe
/// real conflicts. Failure injection hooks allow forcing conflicts and read
/// errors deterministically.
pub struct InMemoryCluster {
    namespace: String,
    state: Mutex<State>,
}

impl InMemoryCluster {
    /// Create an empty cluster bound to `namespace`
    pub fn new(namespace: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            namespace: namespace.into(),
            state: Mutex::new(State::default()),
        })
    }

    /// Store a controller record as-is, assigning a fresh version
    pub async fn insert_controller(&self, mut record: ControllerRecord) -> ControllerRecord {
        let mut state = self.state.lock().await;
        record.namespace = Some(self.namespace.clone());
        record.resource_version = Some(state.next_version());
        state.controllers.insert(record.name.clone(), record.clone());
        record
    }

    /// Current stored copy of a controller record
    pub async fn controller(&self, name: &str) -> Option<ControllerRecord> {
        self.state.lock().await.controllers.get(name).cloned()
    }

    /// Add or replace a pod
    pub async fn add_pod(&self, pod: PodInfo) {
        let mut state = self.state.lock().await;
        state.pods.insert(pod.name.clone(), pod);
    }

    /// Change the phase of an existing pod
    pub async fn set_pod_phase(&self, name: &str, phase: PodPhase) {
        if let Some(pod) = self.state.lock().await.pods.get_mut(name) {
            pod.phase = phase;
        }
    }

    /// Remove a pod without recording a deletion
    pub async fn remove_pod(&self, name: &str) {
        self.state.lock().await.pods.remove(name);
    }

    /// Current copy of a pod
    pub async fn pod(&self, name: &str) -> Option<PodInfo> {
        self.state.lock().await.pods.get(name).cloned()
    }

    /// Stored copy of a secret
    pub async fn secret(&self, name: &str) -> Option<SecretSpec> {
        self.state.lock().await.secrets.get(name).cloned()
    }

    /// Names of pods removed through [`Cluster::delete_pod`], in order
    pub async fn deleted_pods(&self) -> Vec<String> {
        self.state.lock().await.deleted_pods.clone()
    }

    /// Number of successful controller creates and replaces
    pub async fn controller_writes(&self) -> usize {
        self.state.lock().await.controller_writes
    }

    /// Reject the next `count` controller replaces with a conflict
    pub async fn inject_conflicts(&self, count: u32) {
        self.state.lock().await.pending_conflicts = count;
    }

    /// Fail the next `count` controller reads with an API error
    pub async fn inject_read_failures(&self, count: u32) {
        self.state.lock().await.pending_read_failures = count;
    }

    /// Make every pod annotation call fail
    pub async fn fail_pod_annotations(&self, fail: bool) {
        self.state.lock().await.fail_pod_annotations = fail;
    }
}

#[async_trait]
impl Cluster for InMemoryCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_controller(&self, name: &str) -> Result<Option<ControllerRecord>, ClusterError> {
        let mut state = self.state.lock().await;
        if state.pending_read_failures > 0 {
            state.pending_read_failures -= 1;
            return Err(ClusterError::Api("injected read failure".to_string()));
        }
        Ok(state.controllers.get(name).cloned())
    }

    async fn create_controller(
        &self,
        record: &ControllerRecord,
    ) -> Result<ControllerRecord, ClusterError> {
        let mut state = self.state.lock().await;
        if state.controllers.contains_key(&record.name) {
            return Err(ClusterError::Conflict {
                kind: "ReplicationController",
                name: record.name.clone(),
            });
        }
        let mut stored = record.clone();
        stored.namespace = Some(self.namespace.clone());
        stored.resource_version = Some(state.next_version());
        state.controllers.insert(stored.name.clone(), stored.clone());
        state.controller_writes += 1;
        Ok(stored)
    }

    async fn replace_controller(
        &self,
        record: &ControllerRecord,
    ) -> Result<ControllerRecord, ClusterError> {
        let mut state = self.state.lock().await;
        let conflict = || ClusterError::Conflict {
            kind: "ReplicationController",
            name: record.name.clone(),
        };

        let current = state
            .controllers
            .get(&record.name)
            .ok_or_else(|| ClusterError::NotFound {
                kind: "ReplicationController",
                name: record.name.clone(),
            })?;
        if current.resource_version != record.resource_version {
            return Err(conflict());
        }
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            // Someone else won the race: bump the stored version too
            let version = state.next_version();
            if let Some(current) = state.controllers.get_mut(&record.name) {
                current.resource_version = Some(version);
            }
            return Err(conflict());
        }

        let mut stored = record.clone();
        stored.namespace = Some(self.namespace.clone());
        stored.resource_version = Some(state.next_version());
        state.controllers.insert(stored.name.clone(), stored.clone());
        state.controller_writes += 1;
        Ok(stored)
    }

    async fn list_pods(&self) -> Result<Vec<PodInfo>, ClusterError> {
        Ok(self.state.lock().await.pods.values().cloned().collect())
    }

    async fn get_pod(&self, name: &str) -> Result<Option<PodInfo>, ClusterError> {
        Ok(self.state.lock().await.pods.get(name).cloned())
    }

    async fn annotate_pod(
        &self,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        if state.fail_pod_annotations {
            return Err(ClusterError::Api(format!("cannot annotate pod {}", name)));
        }
        let pod = state.pods.get_mut(name).ok_or_else(|| ClusterError::NotFound {
            kind: "Pod",
            name: name.to_string(),
        })?;
        pod.annotations
            .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        if state.pods.remove(name).is_none() {
            return Err(ClusterError::NotFound {
                kind: "Pod",
                name: name.to_string(),
            });
        }
        state.deleted_pods.push(name.to_string());
        Ok(())
    }

    async fn apply_secret(&self, secret: &SecretSpec) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        state.secrets.insert(secret.name.clone(), secret.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stale_replace_conflicts() {
        let cluster = InMemoryCluster::new("default");
        cluster.insert_controller(ControllerRecord::new("rc")).await;

        let first = cluster.get_controller("rc").await.unwrap().unwrap();
        let second = first.clone();

        let mut updated = first;
        updated.set_claim("a", "p1");
        cluster.replace_controller(&updated).await.unwrap();

        let err = cluster.replace_controller(&second).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(cluster.controller_writes().await, 1);
    }

    #[tokio::test]
    async fn test_create_existing_conflicts() {
        let cluster = InMemoryCluster::new("default");
        let created = cluster
            .create_controller(&ControllerRecord::new("rc"))
            .await
            .unwrap();
        assert_eq!(created.namespace.as_deref(), Some("default"));
        assert!(created.resource_version.is_some());

        let err = cluster
            .create_controller(&ControllerRecord::new("rc"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_injected_conflict_invalidates_read() {
        let cluster = InMemoryCluster::new("default");
        cluster.insert_controller(ControllerRecord::new("rc")).await;
        cluster.inject_conflicts(1).await;

        let record = cluster.get_controller("rc").await.unwrap().unwrap();
        assert!(cluster.replace_controller(&record).await.is_err());
        // The old read stays stale after the injected conflict
        assert!(cluster.replace_controller(&record).await.is_err());

        let fresh = cluster.get_controller("rc").await.unwrap().unwrap();
        assert!(cluster.replace_controller(&fresh).await.is_ok());
    }

    #[tokio::test]
    async fn test_pod_annotations_merge() {
        let cluster = InMemoryCluster::new("default");
        cluster.add_pod(PodInfo::running("p1")).await;

        let annotations = BTreeMap::from([("k".to_string(), "v".to_string())]);
        cluster.annotate_pod("p1", &annotations).await.unwrap();
        assert_eq!(
            cluster.pod("p1").await.unwrap().annotations.get("k").map(String::as_str),
            Some("v")
        );

        assert!(cluster.annotate_pod("missing", &annotations).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_pod_records_deletion() {
        let cluster = InMemoryCluster::new("default");
        cluster.add_pod(PodInfo::running("p1")).await;
        cluster.delete_pod("p1").await.unwrap();
        assert_eq!(cluster.deleted_pods().await, vec!["p1".to_string()]);
        assert!(cluster.delete_pod("p1").await.is_err());
    }
}
