//! Kubernetes resource watchers.
//!
//! ProvisioningRequests are driven by a `kube_runtime::Controller`. Changes to
//! the ClusterInstances it owns are mapped back through the owner label, and
//! policy events go through the [`PolicyEventMapper`] into the controller's
//! `reconcile_on` stream.

use crate::error::ControllerError;
use crate::mapper::{PolicyEvent, PolicyEventMapper};
use crate::reconciler::{Reconciler, Requeue};
use crate::store::{CLUSTER_INSTANCE, POLICY};
use crds::{ProvisioningRequest, PROVISIONING_REQUEST_NAME_LABEL};
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use kube::api::DynamicObject;
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{watcher, Controller, WatchStreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Reconcile entry point handed to the controller runtime
async fn reconcile(request: Arc<ProvisioningRequest>, ctx: Arc<Reconciler>) -> Result<Action, ControllerError> {
    let name = request.name_any();
    debug!("Reconciling ProvisioningRequest {}", name);
    let outcome = ctx.reconcile(&name).await?;
    ctx.reset_error(&name);
    Ok(match outcome {
        Requeue::Done => Action::await_change(),
        Requeue::After(interval) => Action::requeue(interval),
    })
}

/// Requeues failed passes with a per-request Fibonacci backoff
fn error_policy(request: Arc<ProvisioningRequest>, error: &ControllerError, ctx: Arc<Reconciler>) -> Action {
    let name = request.name_any();
    ctx.increment_error(&name);
    let (seconds, errors) = ctx.get_backoff_for_resource(&name);
    error!(
        "Reconciliation error for ProvisioningRequest {} (attempt {}): {}, retrying in {}s",
        name,
        errors,
        error,
        seconds
    );
    Action::requeue(Duration::from_secs(seconds))
}

fn owner_of_instance(instance: DynamicObject) -> Option<ObjectRef<ProvisioningRequest>> {
    let owner = instance.labels().get(PROVISIONING_REQUEST_NAME_LABEL)?;
    Some(ObjectRef::new(owner))
}

/// Watches ProvisioningRequests and the resources that feed back into them.
pub struct Watcher {
    client: Client,
    reconciler: Arc<Reconciler>,
    mapper: Arc<PolicyEventMapper>,
}

impl Watcher {
    pub fn new(client: Client, reconciler: Arc<Reconciler>, mapper: PolicyEventMapper) -> Self {
        Self {
            client,
            reconciler,
            mapper: Arc::new(mapper),
        }
    }

    /// Runs the ProvisioningRequest controller until its stream ends
    pub async fn watch_provisioning_requests(&self) -> Result<(), ControllerError> {
        info!("Starting ProvisioningRequest watcher");

        let (policy_tx, policy_rx) = mpsc::unbounded();
        let policies = tokio::spawn(Self::watch_policies(
            self.client.clone(),
            Arc::clone(&self.mapper),
            policy_tx,
        ));

        let requests: Api<ProvisioningRequest> = Api::all(self.client.clone());
        let instance_resource = CLUSTER_INSTANCE.api_resource();
        let instances: Api<DynamicObject> = Api::all_with(self.client.clone(), &instance_resource);

        let controller_config = ControllerConfig::default()
            .debounce(Duration::from_secs(1))
            .concurrency(3);

        Controller::new(requests, watcher::Config::default())
            .with_config(controller_config)
            .watches_with(
                instances,
                instance_resource,
                watcher::Config::default().labels(PROVISIONING_REQUEST_NAME_LABEL),
                owner_of_instance,
            )
            .reconcile_on(policy_rx)
            .shutdown_on_signal()
            .run(reconcile, error_policy, Arc::clone(&self.reconciler))
            .for_each(|res| async move {
                match res {
                    Ok((object, _)) => debug!("Reconciled ProvisioningRequest {}", object.name),
                    Err(e) => error!("Controller error for ProvisioningRequest: {}", e),
                }
            })
            .await;

        policies.abort();
        Ok(())
    }

    /// Feeds policy events to the mapper and forwards the requests it resolves
    async fn watch_policies(
        client: Client,
        mapper: Arc<PolicyEventMapper>,
        tx: UnboundedSender<ObjectRef<ProvisioningRequest>>,
    ) {
        info!("Starting Policy watcher");
        let api: Api<DynamicObject> = Api::all_with(client, &POLICY.api_resource());
        let mut events = watcher(api, watcher::Config::default()).default_backoff().boxed();

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(watcher::Event::Apply(policy) | watcher::Event::InitApply(policy)) => {
                    PolicyEvent::Applied(serde_json::to_value(policy).unwrap_or_default())
                }
                Ok(watcher::Event::Delete(policy)) => {
                    PolicyEvent::Deleted(serde_json::to_value(policy).unwrap_or_default())
                }
                Ok(watcher::Event::Init | watcher::Event::InitDone) => continue,
                Err(e) => {
                    warn!("Policy watch error: {}", e);
                    continue;
                }
            };
            if let Some(owner) = mapper.map(&event).await {
                if tx.unbounded_send(ObjectRef::new(&owner)).is_err() {
                    warn!("ProvisioningRequest controller is gone, stopping Policy watcher");
                    return;
                }
            }
        }
    }
}
