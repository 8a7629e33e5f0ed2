//! Own pod identity

use crate::error::ConfigError;

/// Environment variable carrying the pod name
pub const HOSTNAME_ENV: &str = "HOSTNAME";

/// Resolve this pod's name from `HOSTNAME`, falling back to the machine host name
pub fn pod_identity() -> Result<String, ConfigError> {
    resolve_identity(
        std::env::var(HOSTNAME_ENV).ok(),
        gethostname::gethostname().to_str().map(str::to_owned),
    )
}

/// Pick the first non-blank candidate
pub fn resolve_identity(
    env_value: Option<String>,
    machine_name: Option<String>,
) -> Result<String, ConfigError> {
    env_value
        .into_iter()
        .chain(machine_name)
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .ok_or_else(|| {
            ConfigError::MissingField(format!(
                "pod name: ${} is not set and the host name is unavailable",
                HOSTNAME_ENV
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_wins() {
        let name = resolve_identity(Some("worker-1".into()), Some("machine".into())).unwrap();
        assert_eq!(name, "worker-1");
    }

    #[test]
    fn test_blank_env_falls_back() {
        let name = resolve_identity(Some("  ".into()), Some("machine".into())).unwrap();
        assert_eq!(name, "machine");
    }

    #[test]
    fn test_nothing_available() {
        assert!(matches!(
            resolve_identity(None, None),
            Err(ConfigError::MissingField(_))
        ));
    }
}
