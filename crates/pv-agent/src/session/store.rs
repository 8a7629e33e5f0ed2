//! Persistence of WinRM shell ids

use async_trait::async_trait;
use std::sync::Arc;

use pv_core::error::{ClusterError, SessionError};
use pv_core::{Cluster, ControllerRecord};

/// Attempts at a conflicting read-modify-write before giving up
const MAX_WRITE_ATTEMPTS: u32 = 5;

/// Records which remote shell belongs to which inventory host
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Shell id recorded for `host`
    async fn load(&self, host: &str) -> Result<Option<String>, SessionError>;

    /// Record `session_id` for `host`
    async fn save(&self, host: &str, session_id: &str) -> Result<(), SessionError>;

    /// Forget the shell recorded for `host`
    async fn clear(&self, host: &str) -> Result<(), SessionError>;
}

/// Stores shell ids as annotations on the controller record
pub struct ControllerSessionStore {
    cluster: Arc<dyn Cluster>,
    controller: String,
}

impl ControllerSessionStore {
    /// Create a store writing to `controller`
    pub fn new(cluster: Arc<dyn Cluster>, controller: impl Into<String>) -> Self {
        Self {
            cluster,
            controller: controller.into(),
        }
    }

    async fn read(&self) -> Result<ControllerRecord, SessionError> {
        self.cluster
            .get_controller(&self.controller)
            .await?
            .ok_or_else(|| {
                SessionError::Store(ClusterError::NotFound {
                    kind: "ReplicationController",
                    name: self.controller.clone(),
                })
            })
    }

    /// Apply `change` to a fresh copy of the record, retrying on conflicts.
    ///
    /// `change` returns false when there is nothing to write.
    async fn update<F>(&self, change: F) -> Result<(), SessionError>
    where
        F: Fn(&mut ControllerRecord) -> bool + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut record = self.read().await?;
            if !change(&mut record) {
                return Ok(());
            }
            match self.cluster.replace_controller(&record).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() && attempt < MAX_WRITE_ATTEMPTS => {
                    tracing::debug!(
                        "Conflict updating controller {}, retrying: {}",
                        self.controller,
                        e
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl SessionStore for ControllerSessionStore {
    async fn load(&self, host: &str) -> Result<Option<String>, SessionError> {
        Ok(self.read().await?.session_id(host).map(str::to_owned))
    }

    async fn save(&self, host: &str, session_id: &str) -> Result<(), SessionError> {
        self.update(|record| {
            if record.session_id(host) == Some(session_id) {
                return false;
            }
            record.set_session_id(host, session_id);
            true
        })
        .await
    }

    async fn clear(&self, host: &str) -> Result<(), SessionError> {
        self.update(|record| record.remove_session_id(host).is_some())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pv_core::InMemoryCluster;

    async fn store() -> (Arc<InMemoryCluster>, ControllerSessionStore) {
        let cluster = InMemoryCluster::new("default");
        cluster.insert_controller(ControllerRecord::new("workers")).await;
        let store = ControllerSessionStore::new(cluster.clone(), "workers");
        (cluster, store)
    }

    #[tokio::test]
    async fn test_save_load_clear() {
        let (cluster, store) = store().await;

        assert_eq!(store.load("win1").await.unwrap(), None);
        store.save("win1", "shell-1").await.unwrap();
        assert_eq!(store.load("win1").await.unwrap().as_deref(), Some("shell-1"));

        store.clear("win1").await.unwrap();
        assert_eq!(store.load("win1").await.unwrap(), None);
        assert_eq!(cluster.controller_writes().await, 2);

        // Nothing to clear, nothing written
        store.clear("win1").await.unwrap();
        assert_eq!(cluster.controller_writes().await, 2);
    }

    #[tokio::test]
    async fn test_save_retries_conflicts() {
        let (cluster, store) = store().await;
        cluster.inject_conflicts(2).await;

        store.save("win1", "shell-1").await.unwrap();
        let record = cluster.controller("workers").await.unwrap();
        assert_eq!(record.session_id("win1"), Some("shell-1"));
    }

    #[tokio::test]
    async fn test_persistent_conflicts_fail() {
        let (cluster, store) = store().await;
        cluster.inject_conflicts(MAX_WRITE_ATTEMPTS).await;

        let err = store.save("win1", "shell-1").await.unwrap_err();
        assert!(matches!(err, SessionError::Store(ref e) if e.is_conflict()));
    }

    #[tokio::test]
    async fn test_missing_controller() {
        let cluster = InMemoryCluster::new("default");
        let store = ControllerSessionStore::new(cluster, "workers");
        assert!(store.load("win1").await.is_err());
    }
}
