use std::sync::Arc;

use kube::{runtime::controller::Action, ResourceExt};
use tracing::{info, instrument};

use crate::api::capi::Cluster;
use crate::api::packet::{PacketClusterSpec, PacketClusterStatus};
use crate::codec;
use crate::packet::PacketApiFactory;
use crate::store::{self, ObjectKey, ObjectStore, Persisted, RetryConfig, SecretStore};

use super::{ClusterError, ClusterResult};

/// Converges cluster records against the remote project backing them.
pub struct ClusterActuator<S> {
    store: Arc<S>,
    packet: Arc<dyn PacketApiFactory>,
    retry: RetryConfig,
}

impl<S> ClusterActuator<S>
where
    S: ObjectStore<Cluster> + SecretStore,
{
    pub fn new(store: Arc<S>, packet: Arc<dyn PacketApiFactory>) -> Self {
        Self {
            store,
            packet,
            retry: RetryConfig::default(),
        }
    }

    #[cfg(test)]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Resolve the project named by the cluster payload and persist its id
    /// into the cluster status. Re-running on an already resolved cluster
    /// re-resolves but writes nothing.
    #[instrument(skip_all, fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
    pub async fn reconcile(&self, cluster: &Cluster) -> ClusterResult<Action> {
        let key = ObjectKey::from_obj(cluster);
        let spec: PacketClusterSpec = codec::decode_spec(cluster).map_err(|source| {
            ClusterError::Decode {
                key: key.clone(),
                source,
            }
        })?;
        let status: PacketClusterStatus = codec::decode_status(cluster).map_err(|source| {
            ClusterError::Decode {
                key: key.clone(),
                source,
            }
        })?;

        let secret_key = ObjectKey::new(key.namespace.clone(), spec.secret_ref.clone());
        let secret =
            self.store
                .get_secret(&secret_key)
                .await
                .map_err(|source| ClusterError::Credentials {
                    key: key.clone(),
                    secret: spec.secret_ref.clone(),
                    source,
                })?;
        let api = self
            .packet
            .from_secret(&secret)
            .map_err(|source| ClusterError::Client {
                key: key.clone(),
                source,
            })?;

        let project_id = api.resolve_project_id(&spec.project).await.map_err(|source| {
            ClusterError::ResolveProject {
                key: key.clone(),
                project: spec.project.clone(),
                source,
            }
        })?;

        let resolved = PacketClusterStatus { project_id };
        let persisted =
            store::update_provider_status::<Cluster, _>(self.store.as_ref(), &key, &resolved, &self.retry)
                .await
                .map_err(|source| ClusterError::PersistStatus {
                    key: key.clone(),
                    source,
                })?;
        if persisted == Persisted::Written {
            info!(
                project = %spec.project,
                old_id = %status.project_id,
                project_id = %resolved.project_id,
                "resolved cluster project"
            );
        }

        Ok(Action::await_change())
    }

    /// Clear the resolved project id. Nothing is written when the status is
    /// already empty.
    #[instrument(skip_all, fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
    pub async fn delete(&self, cluster: &Cluster) -> ClusterResult<Action> {
        let key = ObjectKey::from_obj(cluster);
        let cleared = PacketClusterStatus::default();
        let persisted =
            store::update_provider_status::<Cluster, _>(self.store.as_ref(), &key, &cleared, &self.retry)
                .await
                .map_err(|source| ClusterError::PersistStatus {
                    key: key.clone(),
                    source,
                })?;
        if persisted == Persisted::Written {
            info!("cleared cluster project id");
        }

        Ok(Action::await_change())
    }
}
