//! Core domain types: the controller record and the pod population

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Annotation on the controller record holding the inventory snapshot
pub const INVENTORY_ANNOTATION: &str = "podvisor.io/host-inventory";

/// Prefix of claim annotations: `<prefix><host-name> -> <pod-name>`
pub const CLAIM_ANNOTATION_PREFIX: &str = "pod.podvisor.io/";

/// Prefix of WinRM session annotations: `<prefix><host-name> -> <shell-id>`
pub const SESSION_ANNOTATION_PREFIX: &str = "winrm.shellid.podvisor.io/";

/// Pod annotation naming the inventory host the pod supervises
pub const HOST_NAME_ANNOTATION: &str = "podvisor.io/host-name";

/// Pod annotation holding the address of the supervised host
pub const HOST_ADDRESS_ANNOTATION: &str = "podvisor.io/host-address";

/// The shared controller object used for coordination.
///
/// Besides describing the desired pod population, the record carries the
/// inventory snapshot, one claim annotation per leased host and one session
/// annotation per open WinRM shell. `resource_version` is the opaque token
/// used for optimistic concurrency; `None` means the record was never stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerRecord {
    /// Object name
    pub name: String,
    /// Namespace, if known
    pub namespace: Option<String>,
    /// Version token observed when the record was read
    pub resource_version: Option<String>,
    /// Object labels
    pub labels: BTreeMap<String, String>,
    /// Object annotations
    pub annotations: BTreeMap<String, String>,
    /// Pod selector; empty means "select the template labels"
    pub selector: BTreeMap<String, String>,
    /// Desired replica count
    pub replicas: Option<i32>,
    /// Pod template document
    pub template: serde_json::Value,
}

impl ControllerRecord {
    /// Create an empty, never-stored record
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: serde_json::Value::Null,
            ..Default::default()
        }
    }

    /// Inventory snapshot text, if published
    pub fn inventory_text(&self) -> Option<&str> {
        self.annotations
            .get(INVENTORY_ANNOTATION)
            .map(String::as_str)
            .filter(|text| !text.trim().is_empty())
    }

    /// Publish an inventory snapshot
    pub fn set_inventory_text(&mut self, text: impl Into<String>) {
        self.annotations
            .insert(INVENTORY_ANNOTATION.to_string(), text.into());
    }

    /// All claims as `(host name, owning pod)`, ordered by host name
    pub fn claims(&self) -> Vec<(String, String)> {
        self.annotations
            .iter()
            .filter_map(|(key, pod)| {
                key.strip_prefix(CLAIM_ANNOTATION_PREFIX)
                    .map(|host| (host.to_string(), pod.clone()))
            })
            .collect()
    }

    /// Pod currently recorded as owning `host`
    pub fn claim_owner(&self, host: &str) -> Option<&str> {
        self.annotations
            .get(&claim_key(host))
            .map(String::as_str)
    }

    /// Record `pod` as the owner of `host`
    pub fn set_claim(&mut self, host: &str, pod: impl Into<String>) {
        self.annotations.insert(claim_key(host), pod.into());
    }

    /// Remove the claim on `host`, returning the previous owner
    pub fn remove_claim(&mut self, host: &str) -> Option<String> {
        self.annotations.remove(&claim_key(host))
    }

    /// WinRM shell id recorded for `host`
    pub fn session_id(&self, host: &str) -> Option<&str> {
        self.annotations
            .get(&session_key(host))
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Record the WinRM shell id for `host`
    pub fn set_session_id(&mut self, host: &str, id: impl Into<String>) {
        self.annotations.insert(session_key(host), id.into());
    }

    /// Forget the WinRM shell id for `host`
    pub fn remove_session_id(&mut self, host: &str) -> Option<String> {
        self.annotations.remove(&session_key(host))
    }
}

fn claim_key(host: &str) -> String {
    format!("{}{}", CLAIM_ANNOTATION_PREFIX, host)
}

fn session_key(host: &str) -> String {
    format!("{}{}", SESSION_ANNOTATION_PREFIX, host)
}

/// Lifecycle phase of a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PodPhase {
    /// Accepted but not all containers started
    Pending,
    /// Bound to a node, containers running
    Running,
    /// All containers terminated successfully
    Succeeded,
    /// All containers terminated, at least one failed
    Failed,
    /// State could not be obtained
    #[default]
    Unknown,
}

impl PodPhase {
    /// Parse the phase string reported by the API server
    pub fn from_api(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    /// True once the pod can no longer run anything
    pub fn is_terminated(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PodPhase::Pending => write!(f, "pending"),
            PodPhase::Running => write!(f, "running"),
            PodPhase::Succeeded => write!(f, "succeeded"),
            PodPhase::Failed => write!(f, "failed"),
            PodPhase::Unknown => write!(f, "unknown"),
        }
    }
}

/// A port declared by one of the pod's containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPort {
    /// Optional port name
    pub name: Option<String>,
    /// Container port number
    pub port: u16,
}

/// The parts of a pod podvisor cares about
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodInfo {
    /// Pod name (the worker identity)
    pub name: String,
    /// Current phase
    pub phase: PodPhase,
    /// Pod annotations
    pub annotations: BTreeMap<String, String>,
    /// Ports declared by the pod's containers
    pub ports: Vec<ContainerPort>,
}

impl PodInfo {
    /// Create a running pod with no annotations or ports
    pub fn running(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: PodPhase::Running,
            ..Default::default()
        }
    }

    /// True unless the pod has terminated
    pub fn is_alive(&self) -> bool {
        !self.phase.is_terminated()
    }
}

/// True if a pod called `name` is present in `pods` and not terminated
pub fn pod_is_alive(pods: &[PodInfo], name: &str) -> bool {
    pods.iter().any(|pod| pod.name == name && pod.is_alive())
}

/// A secret to create or update in the controller's namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSpec {
    /// Secret name
    pub name: String,
    /// Labels copied from the controller
    pub labels: BTreeMap<String, String>,
    /// Data entries
    pub data: BTreeMap<String, Vec<u8>>,
}
