use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType},
        finalizer::{finalizer, Error as FinalizerError, Event as Finalizer},
        watcher::Config,
    },
    Resource, ResourceExt,
};
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

use crate::api::capi::{Cluster, Machine};
use crate::controllers::cluster::ClusterActuator;
use crate::controllers::machine::{DeviceCall, MachineActuator, PROVISION_RECHECK};
use crate::controllers::MachineError;
use crate::metrics::Diagnostics;
use crate::packet::{PacketApiFactory, PacketClientFactory};
use crate::store::KubeStore;
use crate::{telemetry, Error, Metrics, Result};

pub static PACKET_FINALIZER: &str = "packet.cluster.k8s.io";

// Context for the reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prom metrics
    pub metrics: Metrics,
    /// Machine lifecycle driver
    pub machines: Arc<MachineActuator<KubeStore>>,
    /// Cluster lifecycle driver
    pub clusters: Arc<ClusterActuator<KubeStore>>,
}

impl Context {
    async fn publish(
        &self,
        reference: &ObjectReference,
        reason: &str,
        action: &str,
        note: String,
    ) -> Result<()> {
        self.diagnostics
            .read()
            .await
            .recorder(self.client.clone())
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: reason.into(),
                    note: Some(note),
                    action: action.into(),
                    secondary: None,
                },
                reference,
            )
            .await?;
        Ok(())
    }
}

/// Owning cluster of a machine, looked up through the cluster name label.
async fn cluster_of(ctx: &Context, machine: &Machine) -> Result<Option<Cluster>> {
    let Some(name) = machine.cluster_name() else {
        return Ok(None);
    };
    let api: Api<Cluster> =
        Api::namespaced(ctx.client.clone(), &machine.namespace().unwrap_or_default());
    Ok(api.get_opt(name).await?)
}

#[instrument(skip_all, fields(trace_id = display(telemetry::get_trace_id()), name = machine.name_any(), namespace = machine.namespace()), err)]
async fn reconcile_machine(machine: Arc<Machine>, ctx: Arc<Context>) -> Result<Action> {
    ctx.diagnostics.write().await.last_event = Utc::now();
    let _timer = ctx.metrics.count_and_measure("Machine");

    let namespace = machine.namespace().unwrap_or_default();
    let api: Api<Machine> = Api::namespaced(ctx.client.clone(), namespace.as_str());
    debug!("Reconciling machine");

    finalizer(&api, PACKET_FINALIZER, machine, |event| async {
        match event {
            Finalizer::Apply(machine) => {
                let cluster = cluster_of(&ctx, &machine).await?;
                if ctx.machines.exists(cluster.as_ref(), &machine).await? {
                    Ok(ctx.machines.update(cluster.as_ref(), &machine).await?)
                } else {
                    let (action, call) = ctx.machines.create(cluster.as_ref(), &machine).await?;
                    if call == DeviceCall::Issued {
                        ctx.publish(
                            &machine.object_ref(&()),
                            "Created",
                            "Creating",
                            format!("Created device for `{}`", machine.name_any()),
                        )
                        .await?;
                    }
                    Ok(action)
                }
            }
            Finalizer::Cleanup(machine) => {
                let cluster = cluster_of(&ctx, &machine).await?;
                let (action, call) = ctx.machines.delete(cluster.as_ref(), &machine).await?;
                if call == DeviceCall::Issued {
                    ctx.publish(
                        &machine.object_ref(&()),
                        "Deleted",
                        "Deleting",
                        format!("Released device of `{}`", machine.name_any()),
                    )
                    .await?;
                }
                Ok(action)
            }
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

#[instrument(skip_all, fields(trace_id = display(telemetry::get_trace_id()), name = cluster.name_any(), namespace = cluster.namespace()), err)]
async fn reconcile_cluster(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    ctx.diagnostics.write().await.last_event = Utc::now();
    let _timer = ctx.metrics.count_and_measure("Cluster");

    let namespace = cluster.namespace().unwrap_or_default();
    let api: Api<Cluster> = Api::namespaced(ctx.client.clone(), namespace.as_str());
    debug!("Reconciling cluster");

    finalizer(&api, PACKET_FINALIZER, cluster, |event| async {
        match event {
            Finalizer::Apply(cluster) => Ok(ctx.clusters.reconcile(&cluster).await?),
            Finalizer::Cleanup(cluster) => Ok(ctx.clusters.delete(&cluster).await?),
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

/// A machine waiting on its cluster converges quickly once the project
/// resolves, so it retries faster than other failures.
fn waiting_on_cluster(error: &Error) -> bool {
    match error {
        Error::MachineError(MachineError::ClusterNotReady { .. }) => true,
        Error::FinalizerError(err) => matches!(
            err.as_ref(),
            FinalizerError::ApplyFailed(Error::MachineError(
                MachineError::ClusterNotReady { .. }
            ))
        ),
        _ => false,
    }
}

fn machine_error_policy(_machine: Arc<Machine>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {error:?}");
    ctx.metrics.reconcile_failure("Machine", error);
    if waiting_on_cluster(error) {
        return Action::requeue(PROVISION_RECHECK);
    }
    Action::requeue(Duration::from_secs(5 * 60))
}

fn cluster_error_policy(_cluster: Arc<Cluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {error:?}");
    ctx.metrics.reconcile_failure("Cluster", error);
    Action::requeue(Duration::from_secs(5 * 60))
}

/// State shared between the controllers and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub fn to_context(&self, client: Client) -> Arc<Context> {
        let store = Arc::new(KubeStore::new(client.clone()));
        let packet: Arc<dyn PacketApiFactory> = Arc::new(PacketClientFactory::from_env());
        Arc::new(Context {
            metrics: Metrics::default().register(&self.registry).unwrap(),
            diagnostics: self.diagnostics.clone(),
            machines: Arc::new(MachineActuator::new(store.clone(), packet.clone())),
            clusters: Arc::new(ClusterActuator::new(store, packet)),
            client,
        })
    }
}

/// Initialize the controllers and shared state (given the CRDs are installed)
pub async fn run(state: State) {
    let client = Client::try_default()
        .await
        .expect("failed to create kube Client");
    let clusters = Api::<Cluster>::all(client.clone());
    let machines = Api::<Machine>::all(client.clone());
    if let Err(e) = clusters.list(&ListParams::default().limit(1)).await {
        error!("Clusters are not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }
    if let Err(e) = machines.list(&ListParams::default().limit(1)).await {
        error!("Machines are not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let ctx = state.to_context(client);
    let cluster_controller = Controller::new(clusters, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile_cluster, cluster_error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));
    let machine_controller = Controller::new(machines, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile_machine, machine_error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    tokio::join!(cluster_controller, machine_controller);
}
