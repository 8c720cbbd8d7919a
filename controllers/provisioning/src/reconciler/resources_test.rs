//! Unit tests for cluster namespace resources

#[cfg(test)]
mod tests {
    use super::super::resources::{bmc_secret_name, check_cluster_labels_for_policies};
    use crate::store::mock::MockClusterStore;
    use crate::store::{self, CONFIG_MAP, PROVISIONING_REQUEST, SECRET};
    use crate::test_utils::*;
    use crds::{ConditionStatus, ProvisioningPhase, PROVISIONING_REQUEST_NAME_LABEL};
    use hwplugin_client::MockHardwarePluginClient;
    use serde_json::json;

    #[test]
    fn test_bmc_secret_name() {
        assert_eq!(bmc_secret_name("Node1.Example.com"), "node1-bmc-secret");
        assert_eq!(bmc_secret_name("node2"), "node2-bmc-secret");
    }

    #[test]
    fn test_cluster_labels_for_policies() {
        let labels = json!({"cluster-version": "v4.16", "ct-ns.sno.v1": ""});
        assert!(check_cluster_labels_for_policies(CLUSTER, labels.as_object(), "ct-ns.sno.v1").is_ok());

        let err = check_cluster_labels_for_policies(CLUSTER, None, "ct-ns.sno.v1").unwrap_err();
        assert!(err.to_string().starts_with("No cluster labels configured by the ClusterInstance cluster-1"));

        let labels = json!({"cluster-version": "v4.16"});
        let err = check_cluster_labels_for_policies(CLUSTER, labels.as_object(), "ct-ns.sno.v1").unwrap_err();
        assert!(err.is_input_error());
        assert!(err.to_string().contains("is missing the ct-ns.sno.v1 label"));
    }

    #[tokio::test]
    async fn test_resources_created_in_cluster_namespace() {
        let store = MockClusterStore::new();
        insert_request_fixtures(&store, false);
        let reconciler = create_test_reconciler(&store, &MockHardwarePluginClient::new(PLUGIN_REF));
        let mut task = create_test_task(&reconciler, &store, TEST_REQUEST);
        task.handle_validation().await.unwrap();
        let mut rendered = task.handle_render_cluster_instance().await.unwrap();

        task.handle_cluster_resources(&mut rendered).await.unwrap();

        let bmc = store.object(&SECRET, Some(CLUSTER), "node1-bmc-secret").unwrap();
        assert_eq!(bmc["type"], json!("Opaque"));
        assert_eq!(bmc["data"]["username"], json!("YWRtaW4="));
        assert_eq!(store::labels(&bmc)[PROVISIONING_REQUEST_NAME_LABEL], TEST_REQUEST);
        assert_eq!(
            rendered["spec"]["nodes"][0]["bmcCredentialsName"],
            json!({"name": "node1-bmc-secret"})
        );

        let pull = store.object(&SECRET, Some(CLUSTER), "pull-secret").unwrap();
        assert_eq!(pull["type"], json!("kubernetes.io/dockerconfigjson"));
        assert_eq!(pull["data"][".dockerconfigjson"], json!("e30="));

        let policy = store.object(&CONFIG_MAP, Some("ztp-ct-ns"), "cluster-1-pg").unwrap();
        assert_eq!(policy["data"], json!({"sriov-network-vlan-1": "114"}));

        let condition = stored_condition(&store, TEST_REQUEST, "ClusterResourcesCreated").unwrap();
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(condition.message, "Cluster resources applied");
    }

    #[tokio::test]
    async fn test_repeated_pass_does_not_rewrite_resources() {
        let store = MockClusterStore::new();
        insert_request_fixtures(&store, false);
        let reconciler = create_test_reconciler(&store, &MockHardwarePluginClient::new(PLUGIN_REF));
        let mut task = create_test_task(&reconciler, &store, TEST_REQUEST);
        task.handle_validation().await.unwrap();
        let mut rendered = task.handle_render_cluster_instance().await.unwrap();

        task.handle_cluster_resources(&mut rendered.clone()).await.unwrap();
        let secrets = store.write_count(&SECRET);
        let config_maps = store.write_count(&CONFIG_MAP);
        task.handle_cluster_resources(&mut rendered).await.unwrap();

        assert_eq!(store.write_count(&SECRET), secrets);
        assert_eq!(store.write_count(&CONFIG_MAP), config_maps);
    }

    #[tokio::test]
    async fn test_missing_pull_secret_leaves_request_pending() {
        let store = MockClusterStore::new();
        insert_request_fixtures(&store, false);
        store.remove(&SECRET, Some(TEMPLATE_NAMESPACE), "pull-secret");
        let reconciler = create_test_reconciler(&store, &MockHardwarePluginClient::new(PLUGIN_REF));
        let mut task = create_test_task(&reconciler, &store, TEST_REQUEST);
        task.handle_validation().await.unwrap();
        let mut rendered = task.handle_render_cluster_instance().await.unwrap();

        let err = task.handle_cluster_resources(&mut rendered).await.unwrap_err();
        assert!(err.is_input_error());
        assert!(err
            .to_string()
            .contains("pull secret pull-secret expected to exist in the ct-ns namespace, but it is missing"));

        let status = stored_status(&store, TEST_REQUEST);
        assert_eq!(status.provisioning_status.provisioning_phase, ProvisioningPhase::Pending);
        let condition = stored_condition(&store, TEST_REQUEST, "ClusterResourcesCreated").unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, "Failed");
    }

    #[tokio::test]
    async fn test_missing_bmc_credentials_is_input_error() {
        let store = MockClusterStore::new();
        insert_template_fixtures(&store, false);
        let mut parameters = create_test_parameters();
        parameters["clusterInstanceParameters"]["nodes"][0]
            .as_object_mut()
            .unwrap()
            .remove("bmcCredentialsDetails");
        store.insert(
            &PROVISIONING_REQUEST,
            create_test_provisioning_request(TEST_REQUEST, parameters),
        );
        let reconciler = create_test_reconciler(&store, &MockHardwarePluginClient::new(PLUGIN_REF));
        let mut task = create_test_task(&reconciler, &store, TEST_REQUEST);
        task.handle_validation().await.unwrap();
        let mut rendered = task.handle_render_cluster_instance().await.unwrap();

        let err = task.handle_cluster_resources(&mut rendered).await.unwrap_err();
        assert!(err.to_string().contains("\"bmcCredentialsDetails\" key expected to exist"));
        assert!(store.object(&SECRET, Some(CLUSTER), "node1-bmc-secret").is_none());
    }

    #[tokio::test]
    async fn test_hardware_requests_skip_bmc_secrets() {
        let store = MockClusterStore::new();
        insert_request_fixtures(&store, true);
        let reconciler = create_test_reconciler(&store, &MockHardwarePluginClient::new(PLUGIN_REF));
        let mut task = create_test_task(&reconciler, &store, TEST_REQUEST);
        task.handle_validation().await.unwrap();
        let mut rendered = task.handle_render_cluster_instance().await.unwrap();

        task.handle_cluster_resources(&mut rendered).await.unwrap();

        assert!(store.object(&SECRET, Some(CLUSTER), "node1-bmc-secret").is_none());
        assert!(store.object(&SECRET, Some(CLUSTER), "pull-secret").is_some());
    }
}
