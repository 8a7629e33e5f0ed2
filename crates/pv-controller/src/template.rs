//! Pod template defaults
//!
//! The pod template travels as a JSON document on the controller record; it
//! is decoded into the typed `k8s-openapi` structures for editing.

use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ExecAction, Lifecycle, LifecycleHandler,
    ObjectFieldSelector, PodSpec, PodTemplateSpec, SecretVolumeSource, Volume, VolumeMount,
};
use serde_json::Value;

/// Image used when the manifest leaves the container image empty
pub const DEFAULT_IMAGE: &str = "podvisor/podvisor:latest";
/// Container name used when the manifest leaves it empty
pub const DEFAULT_CONTAINER_NAME: &str = "podvisor";
/// Path of the shell re-entry script inside the container
pub const DEFAULT_BASH_SCRIPT: &str = "/usr/local/bin/bash";

/// Environment variable names shared by the controller and the CLI
pub mod env {
    /// Inventory group supervised by the pods
    pub const HOSTS: &str = "PV_HOSTS";
    /// Controller name
    pub const RC: &str = "PV_RC";
    /// Namespace of the controller
    pub const NAMESPACE: &str = "PV_NAMESPACE";
    /// Command run on the claimed host
    pub const COMMAND: &str = "PV_COMMAND";
    /// Prefix of transport-specific commands, e.g. `PV_COMMAND_WINRM`
    pub const COMMAND_PREFIX: &str = "PV_COMMAND_";
    /// Path of the shell re-entry script
    pub const BASH: &str = "PV_BASH";
}

/// Decode a template document; `null` yields an empty template
pub fn decode(template: &Value) -> Result<PodTemplateSpec, serde_json::Error> {
    if template.is_null() {
        return Ok(PodTemplateSpec::default());
    }
    serde_json::from_value(template.clone())
}

/// Encode a template back into a JSON document
pub fn encode(template: &PodTemplateSpec) -> Result<Value, serde_json::Error> {
    serde_json::to_value(template)
}

/// The pod spec, created when absent
pub fn pod_spec(template: &mut PodTemplateSpec) -> &mut PodSpec {
    template.spec.get_or_insert_with(PodSpec::default)
}

/// The first container, created when the pod has none
pub fn first_container(template: &mut PodTemplateSpec) -> &mut Container {
    let spec = pod_spec(template);
    if spec.containers.is_empty() {
        spec.containers.push(Container::default());
    }
    &mut spec.containers[0]
}

/// Value of a literal environment variable on `container`
pub fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
    container
        .env
        .as_ref()?
        .iter()
        .find(|e| e.name == name)
        .and_then(|e| e.value.as_deref())
}

/// True if the container defines a non-empty command variable
pub fn has_command(container: &Container) -> bool {
    container.env.iter().flatten().any(|e| {
        (e.name == env::COMMAND || e.name.starts_with(env::COMMAND_PREFIX))
            && e.value.as_deref().is_some_and(|v| !v.trim().is_empty())
    })
}

/// Set a literal environment variable, replacing any existing definition
pub fn set_env(container: &mut Container, name: &str, value: &str) {
    upsert_env(
        container,
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        },
    );
}

/// Set an environment variable from a pod field such as `metadata.namespace`
pub fn set_env_from_field(container: &mut Container, name: &str, field_path: &str) {
    upsert_env(
        container,
        EnvVar {
            name: name.to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    api_version: None,
                    field_path: field_path.to_string(),
                }),
                ..Default::default()
            }),
        },
    );
}

fn upsert_env(container: &mut Container, var: EnvVar) {
    let vars = container.env.get_or_insert_with(Vec::new);
    match vars.iter_mut().find(|e| e.name == var.name) {
        Some(existing) => *existing = var,
        None => vars.push(var),
    }
}

/// Run `command` as the container's pre-stop hook
pub fn set_pre_stop(container: &mut Container, command: &[&str]) {
    let lifecycle = container.lifecycle.get_or_insert_with(Lifecycle::default);
    lifecycle.pre_stop = Some(LifecycleHandler {
        exec: Some(ExecAction {
            command: Some(command.iter().map(|s| s.to_string()).collect()),
        }),
        ..Default::default()
    });
}

/// Mount volume `name` at `mount_path`, replacing a mount of the same name
pub fn set_volume_mount(container: &mut Container, name: &str, mount_path: &str) {
    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    match mounts.iter_mut().find(|m| m.name == name) {
        Some(mount) => mount.mount_path = mount_path.to_string(),
        None => mounts.push(VolumeMount {
            name: name.to_string(),
            mount_path: mount_path.to_string(),
            ..Default::default()
        }),
    }
}

/// Declare a volume `name` backed by secret `secret_name`
pub fn set_secret_volume(template: &mut PodTemplateSpec, name: &str, secret_name: &str) {
    let source = SecretVolumeSource {
        secret_name: Some(secret_name.to_string()),
        ..Default::default()
    };
    let volumes = pod_spec(template).volumes.get_or_insert_with(Vec::new);
    match volumes.iter_mut().find(|v| v.name == name) {
        Some(volume) => volume.secret = Some(source),
        None => volumes.push(Volume {
            name: name.to_string(),
            secret: Some(source),
            ..Default::default()
        }),
    }
}

/// Fill in the container fields every worker pod needs
pub fn apply_worker_defaults(template: &mut PodTemplateSpec, group: &str, controller: &str) {
    let container = first_container(template);
    if container.image.as_deref().map_or(true, str::is_empty) {
        container.image = Some(DEFAULT_IMAGE.to_string());
    }
    if container.name.is_empty() {
        container.name = DEFAULT_CONTAINER_NAME.to_string();
    }
    if container.image_pull_policy.is_none() {
        container.image_pull_policy = Some("IfNotPresent".to_string());
    }
    set_pre_stop(container, &["podvisor", "kill"]);
    set_env(container, env::HOSTS, group);
    set_env(container, env::RC, controller);
    set_env(container, env::BASH, DEFAULT_BASH_SCRIPT);
    set_env_from_field(container, env::NAMESPACE, "metadata.namespace");
}
