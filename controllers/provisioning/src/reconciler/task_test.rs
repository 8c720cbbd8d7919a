//! Unit tests for per-pass task state

#[cfg(test)]
mod tests {
    use crate::store::mock::MockClusterStore;
    use crate::store::PROVISIONING_REQUEST;
    use crate::test_utils::*;
    use crds::{ConditionReason, ConditionStatus, ConditionType, ProvisioningPhase};
    use hwplugin_client::MockHardwarePluginClient;

    #[tokio::test]
    async fn test_persist_writes_only_differences() {
        let store = MockClusterStore::new();
        insert_request_fixtures(&store, false);
        let reconciler = create_test_reconciler(&store, &MockHardwarePluginClient::new(PLUGIN_REF));
        let mut task = create_test_task(&reconciler, &store, TEST_REQUEST);

        task.set_in_progress("Cluster installation is in progress");
        task.persist().await.unwrap();
        assert_eq!(store.write_count(&PROVISIONING_REQUEST), 1);

        task.persist().await.unwrap();
        assert_eq!(store.write_count(&PROVISIONING_REQUEST), 1);

        let status = stored_status(&store, TEST_REQUEST);
        assert_eq!(status.provisioning_status.provisioning_phase, ProvisioningPhase::Progressing);
        assert_eq!(task.object.status.as_ref(), Some(&task.status));
    }

    #[tokio::test]
    async fn test_persist_retries_conflicts() {
        let store = MockClusterStore::new();
        insert_request_fixtures(&store, false);
        let reconciler = create_test_reconciler(&store, &MockHardwarePluginClient::new(PLUGIN_REF));
        let mut task = create_test_task(&reconciler, &store, TEST_REQUEST);
        store.inject_conflicts(2);

        task.set_failed("Cluster installation failed");
        task.persist().await.unwrap();

        let status = stored_status(&store, TEST_REQUEST);
        assert_eq!(status.provisioning_status.provisioning_phase, ProvisioningPhase::Failed);
        assert_eq!(status.provisioning_status.provisioning_details, "Cluster installation failed");
    }

    #[tokio::test]
    async fn test_persist_gives_up_after_repeated_conflicts() {
        let store = MockClusterStore::new();
        insert_request_fixtures(&store, false);
        let reconciler = create_test_reconciler(&store, &MockHardwarePluginClient::new(PLUGIN_REF));
        let mut task = create_test_task(&reconciler, &store, TEST_REQUEST);
        store.inject_conflicts(5);

        task.set_failed("Cluster installation failed");
        let err = task.persist().await.unwrap_err();

        assert!(!err.is_input_error());
        assert!(err
            .to_string()
            .starts_with("failed to update status for ProvisioningRequest pr-1"));
        assert_eq!(store.write_count(&PROVISIONING_REQUEST), 0);
    }

    #[tokio::test]
    async fn test_failure_is_not_overwritten_in_the_same_pass() {
        let store = MockClusterStore::new();
        insert_request_fixtures(&store, false);
        let reconciler = create_test_reconciler(&store, &MockHardwarePluginClient::new(PLUGIN_REF));
        let mut task = create_test_task(&reconciler, &store, TEST_REQUEST);

        task.set_failed("Hardware provisioning failed");
        task.set_in_progress("Cluster installation is in progress");
        assert!(task.failed_this_pass());
        assert_eq!(task.phase(), ProvisioningPhase::Failed);
        assert_eq!(task.status.provisioning_status.provisioning_details, "Hardware provisioning failed");
        task.persist().await.unwrap();

        // a later pass starts clean
        let mut next = create_test_task(&reconciler, &store, TEST_REQUEST);
        assert!(!next.failed_this_pass());
        next.set_in_progress("Cluster installation is in progress");
        assert_eq!(next.phase(), ProvisioningPhase::Progressing);
    }

    #[tokio::test]
    async fn test_unchanged_phase_keeps_update_time() {
        let store = MockClusterStore::new();
        insert_request_fixtures(&store, false);
        let reconciler = create_test_reconciler(&store, &MockHardwarePluginClient::new(PLUGIN_REF));
        let mut task = create_test_task(&reconciler, &store, TEST_REQUEST);

        task.set_fulfilled();
        let first = task.status.provisioning_status.update_time;
        assert!(first.is_some());
        task.set_fulfilled();
        assert_eq!(task.status.provisioning_status.update_time, first);

        task.set_deleting();
        assert_eq!(task.phase(), ProvisioningPhase::Deleting);
        assert_eq!(task.status.provisioning_status.provisioning_details, "Deletion is in progress");
    }

    #[tokio::test]
    async fn test_release_prefers_the_request() {
        let store = MockClusterStore::new();
        insert_request_fixtures(&store, false);
        let reconciler = create_test_reconciler(&store, &MockHardwarePluginClient::new(PLUGIN_REF));
        let mut task = create_test_task(&reconciler, &store, TEST_REQUEST);
        assert_eq!(task.release(), None);

        task.handle_validation().await.unwrap();
        assert_eq!(task.release().as_deref(), Some(RELEASE));

        task.object.spec.release = Some(String::new());
        assert_eq!(task.release().as_deref(), Some(RELEASE));

        task.object.spec.release = Some("4.17.0".to_string());
        assert_eq!(task.release().as_deref(), Some("4.17.0"));
    }

    #[tokio::test]
    async fn test_plugin_falls_back_to_the_recorded_ref() {
        let store = MockClusterStore::new();
        insert_request_fixtures(&store, false);
        let reconciler = create_test_reconciler(&store, &MockHardwarePluginClient::new(PLUGIN_REF));

        let mut task = create_test_task(&reconciler, &store, TEST_REQUEST);
        assert!(task.plugin().await.is_err());

        let mut task = create_test_task(&reconciler, &store, TEST_REQUEST);
        task.status.extensions.node_allocation_request_ref_mut().hardware_plugin_ref = PLUGIN_REF.to_string();
        let plugin = task.plugin().await.unwrap();
        assert_eq!(plugin.hardware_plugin_ref(), PLUGIN_REF);

        let mut task = create_test_task(&reconciler, &store, TEST_REQUEST);
        task.status.extensions.node_allocation_request_ref_mut().hardware_plugin_ref = "dell-hwplugin".to_string();
        let err = task.plugin().await.err();
        assert!(matches!(err, Some(e) if e.is_input_error()));
    }

    #[tokio::test]
    async fn test_condition_predicates() {
        let store = MockClusterStore::new();
        insert_request_fixtures(&store, false);
        let reconciler = create_test_reconciler(&store, &MockHardwarePluginClient::new(PLUGIN_REF));
        let mut task = create_test_task(&reconciler, &store, TEST_REQUEST);

        assert!(task.hardware_configured());
        assert!(task.upgrade_settled());
        assert!(!task.cluster_provision_present());
        assert!(!task.fatal_failure());

        task.set_condition(
            ConditionType::ClusterProvisioned,
            ConditionReason::InProgress.as_str(),
            ConditionStatus::False,
            "Provisioning in progress",
        );
        assert!(task.cluster_provision_present());
        assert!(!task.cluster_provision_completed());
        assert!(!task.cluster_provision_timed_out_or_failed());

        task.set_condition(
            ConditionType::HardwareConfigured,
            ConditionReason::InProgress.as_str(),
            ConditionStatus::False,
            "Hardware configuring is in progress",
        );
        assert!(!task.hardware_configured());
        assert!(!task.fatal_failure());

        task.set_condition(
            ConditionType::HardwareConfigured,
            ConditionReason::TimedOut.as_str(),
            ConditionStatus::False,
            "Hardware configuration timed out",
        );
        assert!(task.fatal_failure());

        task.set_condition(
            ConditionType::UpgradeCompleted,
            ConditionReason::InProgress.as_str(),
            ConditionStatus::False,
            "Upgrade is in progress",
        );
        assert!(task.upgrade_initiated());
        assert!(task.upgrade_in_progress());
        assert!(!task.upgrade_settled());

        task.set_condition(
            ConditionType::UpgradeCompleted,
            ConditionReason::Completed.as_str(),
            ConditionStatus::True,
            "Upgrade is completed",
        );
        assert!(task.upgrade_completed());
        assert!(task.upgrade_settled());
    }
}
