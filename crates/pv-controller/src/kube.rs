//! Kubernetes-backed [`Cluster`]
//!
//! The controller record maps onto a `ReplicationController`: its metadata
//! carries the annotations and the resource version, its spec the replica
//! count and pod template.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Pod, ReplicationController, ReplicationControllerSpec, Secret,
};
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use std::collections::BTreeMap;

use pv_core::error::ClusterError;
use pv_core::types::{ContainerPort, PodInfo, PodPhase, SecretSpec};
use pv_core::{Cluster, ControllerRecord};

use crate::template;

const CONTROLLER_KIND: &str = "ReplicationController";

/// Cluster client bound to one namespace
pub struct KubeCluster {
    client: Client,
    namespace: String,
}

impl KubeCluster {
    /// Connect with the ambient kubeconfig or in-cluster service account.
    ///
    /// `namespace` defaults to the client's default namespace.
    pub async fn connect(namespace: Option<String>) -> Result<Self, ClusterError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Api(format!("Failed to create cluster client: {}", e)))?;
        let namespace = namespace
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| client.default_namespace().to_string());
        tracing::debug!("Using namespace {}", namespace);
        Ok(Self { client, namespace })
    }

    /// Wrap an existing client
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn controllers(&self) -> Api<ReplicationController> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Map an API error, turning HTTP 409 into a conflict and 404 into not found
fn map_error(kind: &'static str, name: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(response) if response.code == 409 => ClusterError::Conflict {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(response) if response.code == 404 => ClusterError::NotFound {
            kind,
            name: name.to_string(),
        },
        other => ClusterError::Api(format!("{} {}: {}", kind, name, other)),
    }
}

fn to_record(rc: ReplicationController) -> Result<ControllerRecord, ClusterError> {
    let meta = rc.metadata;
    let spec = rc.spec.unwrap_or_default();
    let template = match spec.template {
        Some(t) => template::encode(&t).map_err(|e| ClusterError::Api(e.to_string()))?,
        None => serde_json::Value::Null,
    };
    Ok(ControllerRecord {
        name: meta.name.unwrap_or_default(),
        namespace: meta.namespace,
        resource_version: meta.resource_version,
        labels: meta.labels.unwrap_or_default(),
        annotations: meta.annotations.unwrap_or_default(),
        selector: spec.selector.unwrap_or_default(),
        replicas: spec.replicas,
        template,
    })
}

fn from_record(record: &ControllerRecord) -> Result<ReplicationController, ClusterError> {
    let template = if record.template.is_null() {
        None
    } else {
        Some(template::decode(&record.template).map_err(|e| ClusterError::Api(e.to_string()))?)
    };
    // Keep the selector the controller was created with
    let selector = Some(record.selector.clone())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            template
                .as_ref()
                .and_then(|t| t.metadata.as_ref())
                .and_then(|m| m.labels.clone())
                .filter(|labels| !labels.is_empty())
        })
        .or_else(|| Some(record.labels.clone()).filter(|l| !l.is_empty()));

    Ok(ReplicationController {
        metadata: ObjectMeta {
            name: Some(record.name.clone()),
            namespace: record.namespace.clone(),
            resource_version: record.resource_version.clone(),
            labels: Some(record.labels.clone()).filter(|l| !l.is_empty()),
            annotations: Some(record.annotations.clone()).filter(|a| !a.is_empty()),
            ..Default::default()
        },
        spec: Some(ReplicationControllerSpec {
            replicas: record.replicas,
            selector,
            template,
            ..Default::default()
        }),
        status: None,
    })
}

fn to_pod_info(pod: Pod) -> PodInfo {
    let phase = PodPhase::from_api(pod.status.as_ref().and_then(|s| s.phase.as_deref()));
    let ports = pod
        .spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|container| container.ports.iter().flatten())
        .filter_map(|port| {
            Some(ContainerPort {
                name: port.name.clone(),
                port: u16::try_from(port.container_port).ok()?,
            })
        })
        .collect();

    PodInfo {
        name: pod.metadata.name.unwrap_or_default(),
        phase,
        annotations: pod.metadata.annotations.unwrap_or_default(),
        ports,
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_controller(&self, name: &str) -> Result<Option<ControllerRecord>, ClusterError> {
        let rc = self
            .controllers()
            .get_opt(name)
            .await
            .map_err(|e| map_error(CONTROLLER_KIND, name, e))?;
        rc.map(to_record).transpose()
    }

    async fn create_controller(
        &self,
        record: &ControllerRecord,
    ) -> Result<ControllerRecord, ClusterError> {
        let mut rc = from_record(record)?;
        rc.metadata.resource_version = None;
        let created = self
            .controllers()
            .create(&PostParams::default(), &rc)
            .await
            .map_err(|e| map_error(CONTROLLER_KIND, &record.name, e))?;
        to_record(created)
    }

    async fn replace_controller(
        &self,
        record: &ControllerRecord,
    ) -> Result<ControllerRecord, ClusterError> {
        let rc = from_record(record)?;
        let replaced = self
            .controllers()
            .replace(&record.name, &PostParams::default(), &rc)
            .await
            .map_err(|e| map_error(CONTROLLER_KIND, &record.name, e))?;
        to_record(replaced)
    }

    async fn list_pods(&self) -> Result<Vec<PodInfo>, ClusterError> {
        let pods = self
            .pods()
            .list(&ListParams::default())
            .await
            .map_err(|e| map_error("Pod", &self.namespace, e))?;
        Ok(pods.items.into_iter().map(to_pod_info).collect())
    }

    async fn get_pod(&self, name: &str) -> Result<Option<PodInfo>, ClusterError> {
        let pod = self
            .pods()
            .get_opt(name)
            .await
            .map_err(|e| map_error("Pod", name, e))?;
        Ok(pod.map(to_pod_info))
    }

    async fn annotate_pod(
        &self,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError> {
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        self.pods()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_error("Pod", name, e))?;
        Ok(())
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError> {
        self.pods()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_error("Pod", name, e))?;
        Ok(())
    }

    async fn apply_secret(&self, spec: &SecretSpec) -> Result<(), ClusterError> {
        let api = self.secrets();
        let data = spec
            .data
            .iter()
            .map(|(k, v)| (k.clone(), ByteString(v.clone())))
            .collect();
        let mut secret = Secret {
            metadata: ObjectMeta {
                name: Some(spec.name.clone()),
                labels: Some(spec.labels.clone()).filter(|l| !l.is_empty()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };

        let current = api
            .get_opt(&spec.name)
            .await
            .map_err(|e| map_error("Secret", &spec.name, e))?;
        let result = match current {
            Some(current) => {
                secret.metadata.resource_version = current.metadata.resource_version;
                api.replace(&spec.name, &PostParams::default(), &secret).await
            }
            None => api.create(&PostParams::default(), &secret).await,
        };
        result.map_err(|e| map_error("Secret", &spec.name, e))?;
        Ok(())
    }
}
