// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for vdisk-operator.
//!
//! These tests run without a Kubernetes cluster and exercise the public
//! helpers of the CRDs, the resource generators and the configuration.

mod crd_tests {
    use vdisk_operator::crd::{
        Condition, ConditionStatus, DataSourceKind, DiskPhase, InUseReason, MigrationResult,
        MigrationState, ReadyReason, Reason, VirtualDisk, VirtualDiskSpec,
    };

    fn disk() -> VirtualDisk {
        let mut disk = VirtualDisk::new("root", VirtualDiskSpec::default());
        disk.metadata.namespace = Some("vms".to_string());
        disk.metadata.uid = Some("4f2a".to_string());
        disk
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(DiskPhase::Pending.to_string(), "Pending");
        assert_eq!(DiskPhase::WaitForFirstConsumer.to_string(), "WaitForFirstConsumer");
        assert_eq!(DiskPhase::Ready.to_string(), "Ready");
        assert_eq!(DiskPhase::Lost.to_string(), "Lost");
        assert_eq!(DiskPhase::Terminating.to_string(), "Terminating");
    }

    #[test]
    fn test_phase_default() {
        assert_eq!(DiskPhase::default(), DiskPhase::Pending);
        assert_eq!(disk().phase(), DiskPhase::Pending);
    }

    #[test]
    fn test_condition_new() {
        let condition = Condition::new("Ready", ConditionStatus::True, "Ready", "", Some(3));
        assert_eq!(condition.r#type, "Ready");
        assert_eq!(condition.status, "True");
        assert!(condition.is_true());
        assert!(!condition.is_false());
        assert_eq!(condition.observed_generation, Some(3));
        assert!(!condition.last_transition_time.is_empty());
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(ReadyReason::PvcLost.as_str(), "Lost");
        assert_eq!("QuotaExceeded".parse::<ReadyReason>().unwrap(), ReadyReason::QuotaExceeded);
        assert!("Bogus".parse::<ReadyReason>().is_err());
        assert_eq!(
            InUseReason::parse("AttachedToVirtualMachine"),
            InUseReason::AttachedToVirtualMachine
        );
        assert_eq!(
            InUseReason::parse("SomethingElse"),
            InUseReason::Retained("SomethingElse".to_string())
        );
    }

    #[test]
    fn test_blank_without_data_source() {
        assert_eq!(disk().data_source_kind(), DataSourceKind::Blank);
        assert_eq!(disk().supplement_name(), "vd-root-4f2a");
    }

    #[test]
    fn test_claim_pointers_during_migration() {
        let mut disk = disk();
        assert_eq!(disk.tracked_claim_name(), None);

        let status = disk.status_mut();
        status.target.persistent_volume_claim = "vd-root-target".to_string();
        status.migration_state = MigrationState {
            source_pvc: "vd-root-4f2a".to_string(),
            target_pvc: "vd-root-target".to_string(),
            start_timestamp: Some("2026-03-01T10:00:00Z".to_string()),
            ..Default::default()
        };
        assert!(disk.is_migrating());
        assert_eq!(disk.tracked_claim_name(), Some("vd-root-target"));
        assert_eq!(disk.provisioned_claim_name(), Some("vd-root-4f2a"));

        let state = &mut disk.status_mut().migration_state;
        state.end_timestamp = Some("2026-03-01T10:05:00Z".to_string());
        state.result = Some(MigrationResult::Succeeded);
        assert!(!disk.is_migrating());
        assert_eq!(disk.provisioned_claim_name(), Some("vd-root-target"));
    }

    #[test]
    fn test_storage_class_changed() {
        let mut disk = disk();
        assert!(!disk.storage_class_changed());

        disk.spec.persistent_volume_claim.storage_class_name = Some("sc-b".to_string());
        assert!(!disk.storage_class_changed());

        disk.status_mut().storage_class_name = Some("sc-a".to_string());
        assert!(disk.storage_class_changed());

        disk.spec.persistent_volume_claim.storage_class_name = Some(String::new());
        assert_eq!(disk.declared_storage_class(), None);
        assert!(!disk.storage_class_changed());
    }

    #[test]
    fn test_migration_state_serializes_camel_case() {
        let state = MigrationState {
            source_pvc: "a".to_string(),
            target_pvc: "b".to_string(),
            target_storage_class: Some("sc-b".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["sourcePvc"], "a");
        assert_eq!(json["targetStorageClass"], "sc-b");
        assert!(json.get("endTimestamp").is_none());
        assert!(MigrationState::default().is_empty());
    }
}

mod resource_tests {
    use vdisk_operator::crd::{OperationType, VirtualDisk, VirtualDiskSpec};
    use vdisk_operator::resources::claim::{ClaimParams, generate_blank_claim, requested_size};
    use vdisk_operator::resources::common::LABEL_DISK_NAME;
    use vdisk_operator::resources::is_owned_by;
    use vdisk_operator::resources::operation::{
        VOLUME_MIGRATION_PREFIX, generate_volume_migration, is_volume_migration,
    };

    fn disk() -> VirtualDisk {
        let mut disk = VirtualDisk::new("root", VirtualDiskSpec::default());
        disk.metadata.namespace = Some("vms".to_string());
        disk.metadata.uid = Some("4f2a".to_string());
        disk
    }

    #[test]
    fn test_blank_claim_is_owned_and_labelled() {
        let disk = disk();
        let claim = generate_blank_claim(
            &disk,
            "vd-root-4f2a",
            &ClaimParams {
                size: "10Gi".to_string(),
                storage_class: Some("sc-a".to_string()),
                ..Default::default()
            },
        );

        assert_eq!(claim.metadata.name.as_deref(), Some("vd-root-4f2a"));
        assert_eq!(claim.metadata.namespace.as_deref(), Some("vms"));
        assert!(is_owned_by(claim.metadata.owner_references.as_deref().unwrap(), &disk));
        assert_eq!(
            claim.metadata.labels.as_ref().unwrap().get(LABEL_DISK_NAME).map(String::as_str),
            Some("root")
        );
        let spec = claim.spec.as_ref().unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("sc-a"));
        assert_eq!(spec.access_modes.as_deref(), Some(&["ReadWriteOnce".to_string()][..]));
        assert_eq!(requested_size(&claim), Some("10Gi"));
    }

    #[test]
    fn test_ownership_matches_uid() {
        let disk = disk();
        let claim = generate_blank_claim(&disk, "c", &ClaimParams::default());
        let mut other = VirtualDisk::new("root", VirtualDiskSpec::default());
        other.metadata.uid = Some("recreated".to_string());
        assert!(!is_owned_by(claim.metadata.owner_references.as_deref().unwrap(), &other));
    }

    #[test]
    fn test_volume_migration_operation() {
        let op = generate_volume_migration("vms", "vm");
        assert_eq!(op.metadata.generate_name.as_deref(), Some(VOLUME_MIGRATION_PREFIX));
        assert_eq!(op.spec.r#type, OperationType::Evict);
        assert_eq!(op.spec.virtual_machine_name, "vm");
        assert!(is_volume_migration(&op));

        let mut unrelated = op.clone();
        unrelated.metadata.annotations = None;
        assert!(!is_volume_migration(&unrelated));
    }
}

mod config_tests {
    use std::collections::HashMap;

    use vdisk_operator::config::{
        ENV_ALLOWED_STORAGE_CLASSES, ENV_HEALTH_PORT, ENV_VOLUME_MIGRATION_ENABLED,
        ENV_WATCH_NAMESPACE, OperatorConfig,
    };

    fn load(vars: &[(&str, &str)]) -> OperatorConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OperatorConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]);
        assert_eq!(config, OperatorConfig::default());
        assert!(!config.volume_migration_enabled);
        assert_eq!(config.health_port, 8080);
        assert!(config.is_storage_class_allowed("anything"));
    }

    #[test]
    fn test_values() {
        let config = load(&[
            (ENV_VOLUME_MIGRATION_ENABLED, "true"),
            (ENV_ALLOWED_STORAGE_CLASSES, "sc-a, sc-b,,"),
            (ENV_WATCH_NAMESPACE, "vms"),
            (ENV_HEALTH_PORT, "9090"),
        ]);
        assert!(config.volume_migration_enabled);
        assert_eq!(config.allowed_storage_classes, vec!["sc-a", "sc-b"]);
        assert!(config.is_storage_class_allowed("sc-b"));
        assert!(!config.is_storage_class_allowed("sc-c"));
        assert_eq!(config.watch_namespace.as_deref(), Some("vms"));
        assert_eq!(config.health_port, 9090);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = load(&[
            (ENV_VOLUME_MIGRATION_ENABLED, "sometimes"),
            (ENV_HEALTH_PORT, "http"),
        ]);
        assert!(!config.volume_migration_enabled);
        assert_eq!(config.health_port, 8080);
    }
}

mod quantity_tests {
    use vdisk_operator::quantity::{format_bytes, parse_bytes};

    #[test]
    fn test_parse_and_format() {
        assert_eq!(parse_bytes("10Gi").unwrap(), 10 * 1024 * 1024 * 1024);
        assert_eq!(format_bytes(parse_bytes("512Mi").unwrap()), "512Mi");
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("Gi").is_err());
    }
}

mod status_tests {
    use vdisk_operator::controller::status;
    use vdisk_operator::crd::{Condition, ConditionStatus, ConditionType};

    #[test]
    fn test_message_normalization() {
        assert_eq!(status::message("waiting for the claim"), "Waiting for the claim.");
        assert_eq!(status::message("Done!"), "Done!");
        assert_eq!(status::message("  "), "");
    }

    #[test]
    fn test_upsert_keeps_one_condition_per_type() {
        let mut conditions = Vec::new();
        status::set(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::False, "Provisioning", "", Some(1)),
        );
        let first_transition = conditions[0].last_transition_time.clone();
        status::set(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::False, "Provisioning", "Still", Some(2)),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, "Still");
        assert_eq!(conditions[0].last_transition_time, first_transition);

        status::set(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::True, "Ready", "", Some(2)),
        );
        assert_eq!(conditions.len(), 1);
        assert!(status::is_true(&conditions, ConditionType::Ready));

        status::remove(&mut conditions, ConditionType::Ready);
        assert!(status::get(&conditions, ConditionType::Ready).is_none());
    }
}
