//! Controller manifest loading
//!
//! The manifest is a YAML replication controller document. Before parsing,
//! `{{ name }}` expressions are substituted with the group variables found in
//! `group_vars/<group>` next to the inventory.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ConfigError;

/// Directory holding per-group variable files
pub const GROUP_VARS_DIR: &str = "group_vars";

/// Desired state of the controller, as declared in the manifest
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerManifest {
    /// Controller name (`metadata.name`)
    pub name: String,
    /// Controller labels (`metadata.labels`)
    pub labels: BTreeMap<String, String>,
    /// Pod selector (`spec.selector`), empty when not declared
    pub selector: BTreeMap<String, String>,
    /// Desired replica count (`spec.replicas`)
    pub replicas: Option<i32>,
    /// Pod template (`spec.template`)
    pub template: Value,
}

/// Parse manifest text that has already been through variable substitution
pub fn parse_manifest(text: &str) -> Result<ControllerManifest, ConfigError> {
    let doc: Value = serde_yaml::from_str(text)?;

    let name = doc
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ConfigError::MissingField("metadata.name".to_string()))?
        .to_string();

    let labels = string_map(doc.pointer("/metadata/labels"));
    let selector = string_map(doc.pointer("/spec/selector"));

    let replicas = match doc.pointer("/spec/replicas") {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            value
                .as_i64()
                .and_then(|r| i32::try_from(r).ok())
                .ok_or_else(|| ConfigError::Invalid(format!("spec.replicas: {}", value)))?,
        ),
    };

    let mut template = doc
        .pointer("/spec/template")
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    if !template.is_object() {
        return Err(ConfigError::Invalid(
            "spec.template must be a mapping".to_string(),
        ));
    }

    // Template labels default to the controller labels
    if !labels.is_empty() {
        let has_labels = template
            .pointer("/metadata/labels")
            .and_then(Value::as_object)
            .is_some_and(|m| !m.is_empty());
        if !has_labels {
            if let Some(obj) = template.as_object_mut() {
                let metadata = obj
                    .entry("metadata")
                    .or_insert_with(|| Value::Object(Default::default()));
                match metadata.as_object_mut() {
                    Some(metadata) => {
                        metadata.insert("labels".to_string(), serde_json::json!(labels));
                    }
                    None => *metadata = serde_json::json!({ "labels": labels }),
                }
            }
        }
    }

    Ok(ControllerManifest {
        name,
        labels,
        selector,
        replicas,
        template,
    })
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    match value {
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect(),
        _ => BTreeMap::new(),
    }
}

/// Read the manifest at `path`, substitute `vars` and parse it
pub fn load_manifest(
    path: &Path,
    vars: &BTreeMap<String, String>,
) -> Result<ControllerManifest, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Invalid(format!("Failed to read manifest {}: {}", path.display(), e))
    })?;
    parse_manifest(&replace_variables(&raw, vars))
}

/// Load `group_vars/<group>` under `dir`. A missing file yields no variables.
///
/// Values may refer to other variables of the same file; they are expanded
/// once.
pub fn load_group_variables(
    dir: &Path,
    group: &str,
) -> Result<BTreeMap<String, String>, ConfigError> {
    let path = dir.join(GROUP_VARS_DIR).join(group);
    if !path.exists() {
        return Ok(BTreeMap::new());
    }

    let raw = std::fs::read_to_string(&path).map_err(|e| {
        ConfigError::Invalid(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let parsed: Option<BTreeMap<String, serde_yaml::Value>> = serde_yaml::from_str(&raw)?;

    let mut vars = BTreeMap::new();
    for (key, value) in parsed.unwrap_or_default() {
        let text = match value {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            _ => {
                tracing::debug!("Skipping non-scalar group variable {}", key);
                continue;
            }
        };
        vars.insert(key, text);
    }

    let expanded = vars
        .iter()
        .map(|(k, v)| (k.clone(), replace_variables(v, &vars)))
        .collect();
    Ok(expanded)
}

/// Replace every `{{ name }}` in `text` with its value
pub fn replace_variables(text: &str, vars: &BTreeMap<String, String>) -> String {
    vars.iter().fold(text.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{{ {} }}}}", key), value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
apiVersion: v1
kind: ReplicationController
metadata:
  name: {{ app_name }}
  labels:
    app: {{ app_name }}
spec:
  replicas: 2
  template:
    spec:
      containers:
        - name: podvisor
          image: podvisor:latest
          env:
            - name: PV_COMMAND
              value: "{{ app_home }}/bin/run.sh"
"#;

    fn vars() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app_name".to_string(), "workers".to_string()),
            ("app_home".to_string(), "/opt/app".to_string()),
        ])
    }

    #[test]
    fn test_replace_variables() {
        assert_eq!(
            replace_variables("{{ a }}-{{ b }} {{ c }} {{a}}", &BTreeMap::from([
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ])),
            "1-2 {{ c }} {{a}}"
        );
    }

    #[test]
    fn test_parse_manifest_with_substitution() {
        let manifest = parse_manifest(&replace_variables(MANIFEST, &vars())).unwrap();
        assert_eq!(manifest.name, "workers");
        assert_eq!(manifest.replicas, Some(2));
        assert_eq!(manifest.labels.get("app").map(String::as_str), Some("workers"));
        assert!(manifest.selector.is_empty());
        assert_eq!(
            manifest.template.pointer("/metadata/labels/app"),
            Some(&Value::String("workers".into()))
        );
        assert_eq!(
            manifest
                .template
                .pointer("/spec/containers/0/env/0/value")
                .and_then(Value::as_str),
            Some("/opt/app/bin/run.sh")
        );
    }

    #[test]
    fn test_declared_selector() {
        let manifest = parse_manifest(
            "metadata:\n  name: x\nspec:\n  selector:\n    tier: worker\n  template:\n    metadata:\n      labels:\n        tier: worker\n        build: \"7\"\n",
        )
        .unwrap();
        assert_eq!(
            manifest.selector,
            BTreeMap::from([("tier".to_string(), "worker".to_string())])
        );
    }

    #[test]
    fn test_manifest_without_name_is_rejected() {
        let err = parse_manifest("metadata: {}\nspec: {}\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));
    }

    #[test]
    fn test_replicas_absent() {
        let manifest = parse_manifest("metadata:\n  name: x\n").unwrap();
        assert_eq!(manifest.replicas, None);
        assert!(manifest.template.is_object());
    }

    #[test]
    fn test_group_variables() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(GROUP_VARS_DIR)).unwrap();
        std::fs::write(
            dir.path().join(GROUP_VARS_DIR).join("appservers"),
            "app_name: workers\nport: 8080\nurl: \"http://{{ app_name }}:{{ port }}\"\nlist: [1, 2]\n",
        )
        .unwrap();

        let vars = load_group_variables(dir.path(), "appservers").unwrap();
        assert_eq!(vars.get("port").map(String::as_str), Some("8080"));
        assert_eq!(vars.get("url").map(String::as_str), Some("http://workers:8080"));
        assert!(!vars.contains_key("list"));

        assert!(load_group_variables(dir.path(), "other").unwrap().is_empty());
    }

    #[test]
    fn test_load_manifest_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rc.yml");
        std::fs::write(&path, MANIFEST).unwrap();
        let manifest = load_manifest(&path, &vars()).unwrap();
        assert_eq!(manifest.name, "workers");
    }
}
