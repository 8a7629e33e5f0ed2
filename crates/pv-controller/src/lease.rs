//! Host lease coordination
//!
//! Every worker pod runs [`LeaseCoordinator::claim_host`] on startup. The
//! controller record is the only shared state: a claim is an annotation
//! `pod.podvisor.io/<host> = <pod>` written with the resource version the
//! record was read at, so two pods racing for the same host cannot both
//! succeed. Claims owned by pods that are gone or terminated are reclaimed.

use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use pv_core::config::SupervisorConfig;
use pv_core::error::ClusterError;
use pv_core::inventory::{parse_snapshot, HostEntry};
use pv_core::types::{pod_is_alive, HOST_ADDRESS_ANNOTATION, HOST_NAME_ANNOTATION};
use pv_core::{Cluster, ControllerRecord};

use crate::backoff::RandomBackoff;

/// Environment variable listing the variables exported to the remote command
pub const EXPORT_ENV_VARS: &str = "PV_EXPORT_ENV_VARS";

/// A host successfully claimed by this pod
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    /// The claimed inventory entry
    pub entry: HostEntry,
    /// Controller record as stored after the claim
    pub record: ControllerRecord,
    /// Environment exported to the remote command
    pub env: BTreeMap<String, String>,
}

/// Lease failures
#[derive(Error, Debug)]
pub enum LeaseError {
    /// The controller record does not exist
    #[error("No controller found with name {controller}")]
    ControllerNotFound { controller: String },

    /// The controller record carries no inventory snapshot
    #[error("Could not find the host inventory annotation on controller {controller}")]
    MissingInventory { controller: String },

    /// The picked entry cannot be supervised
    #[error("Invalid inventory entry {name}: {reason}")]
    InvalidEntry { name: String, reason: String },

    /// Every inventory host is claimed by another live pod
    #[error("No more hosts available to be supervised: {claimed} of {total} hosts are claimed by other pods")]
    NoHostsAvailable { total: usize, claimed: usize },

    /// Cluster API failure during an attempt
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// All attempts were used up
    #[error("Could not claim a host on controller {controller} for hosts {group} after {attempts} attempts: {last_reason}")]
    LeaseExhausted {
        controller: String,
        group: String,
        attempts: u32,
        last_reason: String,
    },

    /// The host was claimed but the own pod could not be annotated
    #[error("Claimed host {} but failed to annotate pod: {source}", lease.entry.name)]
    PodAnnotation {
        lease: Box<Lease>,
        #[source]
        source: ClusterError,
    },
}

impl LeaseError {
    /// True if another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LeaseError::NoHostsAvailable { .. } | LeaseError::Cluster(_)
        )
    }
}

/// Attempt and backoff settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    /// Maximum number of claim attempts
    pub max_attempts: u32,
    /// Sleep window before every attempt after the first
    pub backoff: RandomBackoff,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

impl From<&SupervisorConfig> for LeaseConfig {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: RandomBackoff::from_config(config),
        }
    }
}

/// Claims inventory hosts on behalf of a pod
pub struct LeaseCoordinator {
    cluster: Arc<dyn Cluster>,
    config: LeaseConfig,
    export_env: BTreeMap<String, String>,
}

impl LeaseCoordinator {
    /// Create a coordinator
    pub fn new(cluster: Arc<dyn Cluster>, config: LeaseConfig) -> Self {
        Self {
            cluster,
            config,
            export_env: BTreeMap::new(),
        }
    }

    /// Set the environment handed out with every lease
    pub fn with_export_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.export_env = env;
        self
    }

    /// Claim one host of `controller`'s inventory for `self_pod`.
    ///
    /// Retries conflicts, read failures and "no hosts available" until
    /// `max_attempts` is reached. Configuration problems fail immediately.
    pub async fn claim_host(
        &self,
        self_pod: &str,
        group: &str,
        controller: &str,
    ) -> Result<Lease, LeaseError> {
        let mut last_reason = String::new();

        for attempt in 1..=self.config.max_attempts {
            if attempt > 1 {
                let delay = self.config.backoff.next_delay();
                tracing::debug!("Sleeping {:?} before claim attempt {}", delay, attempt);
                tokio::time::sleep(delay).await;
            }

            match self.try_claim(self_pod, controller).await {
                Ok(lease) => {
                    tracing::info!(
                        "Pod {} claimed host {} ({}) on attempt {}",
                        self_pod,
                        lease.entry.name,
                        lease.entry.host,
                        attempt
                    );
                    return self.stamp_pod(self_pod, lease).await;
                }
                Err(e) if e.is_retryable() => {
                    tracing::info!("Claim attempt {} for hosts {} failed: {}", attempt, group, e);
                    last_reason = e.to_string();
                }
                Err(e) => return Err(e),
            }
        }

        Err(LeaseError::LeaseExhausted {
            controller: controller.to_string(),
            group: group.to_string(),
            attempts: self.config.max_attempts,
            last_reason,
        })
    }

    async fn try_claim(&self, self_pod: &str, controller: &str) -> Result<Lease, LeaseError> {
        let mut record = self
            .cluster
            .get_controller(controller)
            .await?
            .ok_or_else(|| LeaseError::ControllerNotFound {
                controller: controller.to_string(),
            })?;
        let pods = self.cluster.list_pods().await?;

        let entries = match record.inventory_text() {
            Some(text) => parse_snapshot(text),
            None => {
                return Err(LeaseError::MissingInventory {
                    controller: controller.to_string(),
                })
            }
        };
        tracing::debug!(
            "Controller {} version {:?} lists {} hosts",
            controller,
            record.resource_version,
            entries.len()
        );

        let mut candidates: Vec<&HostEntry> = entries.iter().collect();
        let mut preferred: Option<String> = None;
        let mut claimed = 0;

        for (host, owner) in record.claims() {
            if !pod_is_alive(&pods, &owner) {
                tracing::info!(
                    "Pod {} is no longer running, releasing its claim on host {}",
                    owner,
                    host
                );
                record.remove_claim(&host);
            } else if owner == self_pod {
                if preferred.is_none() && entries.iter().any(|e| e.name == host) {
                    preferred = Some(host);
                }
            } else {
                tracing::debug!("Host {} is already claimed by pod {}", host, owner);
                candidates.retain(|e| e.name != host);
                claimed += 1;
            }
        }

        if candidates.is_empty() {
            return Err(LeaseError::NoHostsAvailable {
                total: entries.len(),
                claimed,
            });
        }

        let picked = match preferred
            .as_deref()
            .and_then(|name| candidates.iter().find(|e| e.name == name))
        {
            Some(entry) => (*entry).clone(),
            None => pick_random(&candidates),
        };

        picked
            .validate()
            .map_err(|reason| LeaseError::InvalidEntry {
                name: picked.name.clone(),
                reason,
            })?;

        for (host, owner) in record.claims() {
            if owner == self_pod && host != picked.name {
                record.remove_claim(&host);
            }
        }
        record.set_claim(&picked.name, self_pod);

        let stored = self.cluster.replace_controller(&record).await?;
        Ok(Lease {
            entry: picked,
            record: stored,
            env: self.export_env.clone(),
        })
    }

    async fn stamp_pod(&self, self_pod: &str, lease: Lease) -> Result<Lease, LeaseError> {
        let annotations = BTreeMap::from([
            (HOST_NAME_ANNOTATION.to_string(), lease.entry.name.clone()),
            (HOST_ADDRESS_ANNOTATION.to_string(), lease.entry.host.clone()),
        ]);

        match self.cluster.annotate_pod(self_pod, &annotations).await {
            Ok(()) => Ok(lease),
            Err(source) => Err(LeaseError::PodAnnotation {
                lease: Box::new(lease),
                source,
            }),
        }
    }
}

fn pick_random(candidates: &[&HostEntry]) -> HostEntry {
    let mut rng = rand::thread_rng();
    candidates
        .choose(&mut rng)
        .map(|entry| (*entry).clone())
        .unwrap_or_default()
}

/// Resolve the space separated variable `names` through `lookup`.
///
/// Names without a non-empty value are skipped.
pub fn export_env_from<F>(names: &str, lookup: F) -> BTreeMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    names
        .split_whitespace()
        .filter_map(|name| {
            let value = lookup(name).filter(|v| !v.is_empty())?;
            tracing::debug!("Exporting environment variable {}", name);
            Some((name.to_string(), value))
        })
        .collect()
}

/// Resolve the names listed in `PV_EXPORT_ENV_VARS` from the process environment
pub fn export_env_from_process() -> BTreeMap<String, String> {
    let names = std::env::var(EXPORT_ENV_VARS).unwrap_or_default();
    export_env_from(&names, |name| std::env::var(name).ok())
}
