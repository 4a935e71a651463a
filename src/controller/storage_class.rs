//! Storage class resolution and usability checks.

use std::sync::Arc;

use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;

use crate::config::OperatorConfig;
use crate::controller::error::Result;
use crate::crd::{LABEL_DEPRECATED_STORAGE_CLASS, StorageClassReadyReason, VirtualDisk};
use crate::store::DiskStore;

/// Annotation flagging the cluster default storage class.
pub const ANNOTATION_DEFAULT_CLASS: &str = "storageclass.kubernetes.io/is-default-class";

pub const BINDING_WAIT_FOR_FIRST_CONSUMER: &str = "WaitForFirstConsumer";

/// Result of checking a storage class.
#[derive(Clone, Debug)]
pub enum ClassCheck {
    Usable(StorageClass),
    NotFound(String),
    NotAllowed(String),
    Deprecated(String),
    Terminating(String),
}

impl ClassCheck {
    pub fn usable(&self) -> Option<&StorageClass> {
        match self {
            ClassCheck::Usable(class) => Some(class),
            _ => None,
        }
    }

    pub fn reason(&self) -> StorageClassReadyReason {
        match self {
            ClassCheck::Usable(_) => StorageClassReadyReason::StorageClassReady,
            ClassCheck::NotFound(_) => StorageClassReadyReason::StorageClassNotFound,
            ClassCheck::NotAllowed(_) => StorageClassReadyReason::StorageClassNotAllowed,
            ClassCheck::Deprecated(_) => StorageClassReadyReason::StorageClassDeprecated,
            ClassCheck::Terminating(_) => StorageClassReadyReason::StorageClassTerminating,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ClassCheck::Usable(_) => String::new(),
            ClassCheck::NotFound(name) => format!("StorageClass {name} not found"),
            ClassCheck::NotAllowed(name) => {
                format!("StorageClass {name} is not allowed by the storage class policy")
            }
            ClassCheck::Deprecated(name) => {
                format!("StorageClass {name} is deprecated, please use a different one")
            }
            ClassCheck::Terminating(name) => format!("StorageClass {name} is terminating"),
        }
    }
}

pub fn is_default(class: &StorageClass) -> bool {
    class
        .annotations()
        .get(ANNOTATION_DEFAULT_CLASS)
        .is_some_and(|v| v == "true")
}

pub fn is_deprecated(class: &StorageClass) -> bool {
    class
        .labels()
        .get(LABEL_DEPRECATED_STORAGE_CLASS)
        .is_some_and(|v| v == "true")
}

/// The class defers binding until a consumer is scheduled.
pub fn is_wait_for_first_consumer(class: &StorageClass) -> bool {
    class.volume_binding_mode.as_deref() == Some(BINDING_WAIT_FOR_FIRST_CONSUMER)
}

/// Storage class lookups applying the operator's policy.
#[derive(Clone)]
pub struct StorageClassService {
    store: Arc<dyn DiskStore>,
    config: Arc<OperatorConfig>,
}

impl StorageClassService {
    pub fn new(store: Arc<dyn DiskStore>, config: Arc<OperatorConfig>) -> Self {
        Self { store, config }
    }

    /// Name of the class a disk should be provisioned on.
    ///
    /// Declared class, then provisioned class, then the configured default,
    /// then the cluster default.
    pub async fn resolve_name(&self, disk: &VirtualDisk) -> Result<Option<String>> {
        if let Some(name) = disk
            .declared_storage_class()
            .or_else(|| disk.provisioned_storage_class())
        {
            return Ok(Some(name.to_string()));
        }
        if let Some(name) = &self.config.default_storage_class {
            return Ok(Some(name.clone()));
        }
        Ok(self
            .store
            .list_storage_classes()
            .await?
            .iter()
            .find(|class| is_default(class))
            .map(|class| class.name_any()))
    }

    /// Check a class by name against the policy.
    pub async fn check(&self, name: &str) -> Result<ClassCheck> {
        let Some(class) = self.store.get_storage_class(name).await? else {
            return Ok(ClassCheck::NotFound(name.to_string()));
        };
        if !self.config.is_storage_class_allowed(name) {
            return Ok(ClassCheck::NotAllowed(name.to_string()));
        }
        if is_deprecated(&class) {
            return Ok(ClassCheck::Deprecated(name.to_string()));
        }
        if class.metadata.deletion_timestamp.is_some() {
            return Ok(ClassCheck::Terminating(name.to_string()));
        }
        Ok(ClassCheck::Usable(class))
    }

    pub async fn get(&self, name: &str) -> Result<Option<StorageClass>> {
        self.store.get_storage_class(name).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::crd::VirtualDiskSpec;
    use crate::store::MockDiskStore;

    fn class(name: &str, default: bool) -> StorageClass {
        let annotations = default.then(|| {
            BTreeMap::from([(ANNOTATION_DEFAULT_CLASS.to_string(), "true".to_string())])
        });
        StorageClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations,
                ..Default::default()
            },
            provisioner: "csi.example.com".to_string(),
            ..Default::default()
        }
    }

    fn service(store: MockDiskStore, config: OperatorConfig) -> StorageClassService {
        StorageClassService::new(Arc::new(store), Arc::new(config))
    }

    #[tokio::test]
    async fn test_resolve_prefers_declared_class() {
        let mut disk = VirtualDisk::new("root", VirtualDiskSpec::default());
        disk.spec.persistent_volume_claim.storage_class_name = Some("fast".to_string());
        disk.status_mut().storage_class_name = Some("slow".to_string());

        let svc = service(MockDiskStore::new(), OperatorConfig::default());
        assert_eq!(svc.resolve_name(&disk).await.unwrap().as_deref(), Some("fast"));
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_cluster_default() {
        let mut store = MockDiskStore::new();
        store
            .expect_list_storage_classes()
            .returning(|| Ok(vec![class("slow", false), class("local", true)]));

        let disk = VirtualDisk::new("root", VirtualDiskSpec::default());
        let svc = service(store, OperatorConfig::default());
        assert_eq!(svc.resolve_name(&disk).await.unwrap().as_deref(), Some("local"));
    }

    #[tokio::test]
    async fn test_configured_default_beats_cluster_default() {
        let config = OperatorConfig {
            default_storage_class: Some("replicated".to_string()),
            ..Default::default()
        };
        let disk = VirtualDisk::new("root", VirtualDiskSpec::default());
        let svc = service(MockDiskStore::new(), config);
        assert_eq!(
            svc.resolve_name(&disk).await.unwrap().as_deref(),
            Some("replicated")
        );
    }

    #[tokio::test]
    async fn test_check_applies_policy() {
        let mut store = MockDiskStore::new();
        store.expect_get_storage_class().returning(|name| {
            let mut sc = class(name, false);
            if name == "old" {
                sc.metadata.labels = Some(BTreeMap::from([(
                    LABEL_DEPRECATED_STORAGE_CLASS.to_string(),
                    "true".to_string(),
                )]));
            }
            Ok((name != "missing").then_some(sc))
        });
        let config = OperatorConfig {
            allowed_storage_classes: vec!["fast".to_string(), "old".to_string()],
            ..Default::default()
        };
        let svc = service(store, config);

        assert!(svc.check("fast").await.unwrap().usable().is_some());
        assert_eq!(
            svc.check("missing").await.unwrap().reason(),
            StorageClassReadyReason::StorageClassNotFound
        );
        assert_eq!(
            svc.check("slow").await.unwrap().reason(),
            StorageClassReadyReason::StorageClassNotAllowed
        );
        assert_eq!(
            svc.check("old").await.unwrap().reason(),
            StorageClassReadyReason::StorageClassDeprecated
        );
    }

    #[test]
    fn test_binding_mode() {
        let mut sc = class("local", false);
        assert!(!is_wait_for_first_consumer(&sc));
        sc.volume_binding_mode = Some(BINDING_WAIT_FOR_FIRST_CONSUMER.to_string());
        assert!(is_wait_for_first_consumer(&sc));
    }
}
