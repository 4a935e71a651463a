//! Operator configuration read from the environment.

use tracing::warn;

pub const ENV_VOLUME_MIGRATION_ENABLED: &str = "VDISK_VOLUME_MIGRATION_ENABLED";
pub const ENV_ALLOWED_STORAGE_CLASSES: &str = "VDISK_ALLOWED_STORAGE_CLASSES";
pub const ENV_DEFAULT_STORAGE_CLASS: &str = "VDISK_DEFAULT_STORAGE_CLASS";
pub const ENV_WATCH_NAMESPACE: &str = "VDISK_WATCH_NAMESPACE";
pub const ENV_REGISTRY_AUTH_SECRET: &str = "VDISK_REGISTRY_AUTH_SECRET";
pub const ENV_HEALTH_PORT: &str = "VDISK_HEALTH_PORT";

const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Runtime configuration of the operator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Storage class migration and the volume migration controller.
    pub volume_migration_enabled: bool,
    /// Storage classes disks may use. Empty allows all.
    pub allowed_storage_classes: Vec<String>,
    /// Storage class used when a disk declares none.
    pub default_storage_class: Option<String>,
    /// Restrict the controllers to one namespace.
    pub watch_namespace: Option<String>,
    /// Pull secret for import jobs reading from the registry cache.
    pub registry_auth_secret: Option<String>,
    pub health_port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            volume_migration_enabled: false,
            allowed_storage_classes: Vec::new(),
            default_storage_class: None,
            watch_namespace: None,
            registry_auth_secret: None,
            health_port: DEFAULT_HEALTH_PORT,
        }
    }
}

impl OperatorConfig {
    /// Load the configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let volume_migration_enabled = match non_empty(ENV_VOLUME_MIGRATION_ENABLED) {
            None => defaults.volume_migration_enabled,
            Some(value) => parse_bool(&value).unwrap_or_else(|| {
                warn!(
                    variable = ENV_VOLUME_MIGRATION_ENABLED,
                    value = %value,
                    "Invalid boolean, using default"
                );
                defaults.volume_migration_enabled
            }),
        };

        let allowed_storage_classes = non_empty(ENV_ALLOWED_STORAGE_CLASSES)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let health_port = match non_empty(ENV_HEALTH_PORT) {
            None => defaults.health_port,
            Some(value) => value.parse().unwrap_or_else(|_| {
                warn!(variable = ENV_HEALTH_PORT, value = %value, "Invalid port, using default");
                defaults.health_port
            }),
        };

        Self {
            volume_migration_enabled,
            allowed_storage_classes,
            default_storage_class: non_empty(ENV_DEFAULT_STORAGE_CLASS),
            watch_namespace: non_empty(ENV_WATCH_NAMESPACE),
            registry_auth_secret: non_empty(ENV_REGISTRY_AUTH_SECRET),
            health_port,
        }
    }

    /// Storage class policy check.
    pub fn is_storage_class_allowed(&self, name: &str) -> bool {
        self.allowed_storage_classes.is_empty()
            || self.allowed_storage_classes.iter().any(|allowed| allowed == name)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> OperatorConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OperatorConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        assert_eq!(config(&[]), OperatorConfig::default());
    }

    #[test]
    fn test_reads_variables() {
        let cfg = config(&[
            (ENV_VOLUME_MIGRATION_ENABLED, "true"),
            (ENV_ALLOWED_STORAGE_CLASSES, "fast, slow,,"),
            (ENV_DEFAULT_STORAGE_CLASS, "fast"),
            (ENV_HEALTH_PORT, "9090"),
        ]);
        assert!(cfg.volume_migration_enabled);
        assert_eq!(cfg.allowed_storage_classes, vec!["fast", "slow"]);
        assert_eq!(cfg.default_storage_class.as_deref(), Some("fast"));
        assert_eq!(cfg.health_port, 9090);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let cfg = config(&[
            (ENV_VOLUME_MIGRATION_ENABLED, "maybe"),
            (ENV_HEALTH_PORT, "http"),
        ]);
        assert!(!cfg.volume_migration_enabled);
        assert_eq!(cfg.health_port, DEFAULT_HEALTH_PORT);
    }

    #[test]
    fn test_storage_class_policy() {
        let open = OperatorConfig::default();
        assert!(open.is_storage_class_allowed("anything"));

        let restricted = config(&[(ENV_ALLOWED_STORAGE_CLASSES, "fast")]);
        assert!(restricted.is_storage_class_allowed("fast"));
        assert!(!restricted.is_storage_class_allowed("slow"));
    }
}
