use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::{runtime::controller::Action, ResourceExt};
use tracing::{debug, info, instrument};

use crate::api::capi::{Cluster, Machine};
use crate::api::packet::{
    PacketClusterSpec, PacketClusterStatus, PacketMachineSpec, PacketMachineStatus,
};
use crate::codec;
use crate::packet::{ApiError, PacketApi, PacketApiFactory};
use crate::store::{self, ObjectKey, ObjectStore, RetryConfig, SecretStore};

use super::{MachineError, MachineResult};

/// Operating system installed when a machine payload does not pick one.
pub const DEFAULT_OS: &str = "coreos_stable";

/// Delay before re-checking an in-flight device operation.
pub const PROVISION_RECHECK: Duration = Duration::from_secs(15);

/// Whether a lifecycle operation issued a remote device call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceCall {
    /// A device create or delete went out.
    Issued,
    /// The operation finished without touching the remote device.
    Skipped,
}

/// Drives machine records through the device lifecycle. Every operation
/// takes the owning cluster alongside the machine; lifecycle decisions
/// derive from the recorded device id, so each operation is safe to
/// re-enter.
pub struct MachineActuator<S> {
    store: Arc<S>,
    packet: Arc<dyn PacketApiFactory>,
    retry: RetryConfig,
}

impl<S> MachineActuator<S>
where
    S: ObjectStore<Machine> + SecretStore,
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

    fn linked<'a>(key: &ObjectKey, cluster: Option<&'a Cluster>) -> MachineResult<&'a Cluster> {
        cluster.ok_or_else(|| MachineError::MissingCluster { key: key.clone() })
    }

    fn cluster_payloads(
        key: &ObjectKey,
        cluster: &Cluster,
    ) -> MachineResult<(PacketClusterSpec, PacketClusterStatus)> {
        let spec = codec::decode_spec(cluster).map_err(|source| MachineError::DecodeCluster {
            key: key.clone(),
            source,
        })?;
        let status = codec::decode_status(cluster).map_err(|source| MachineError::DecodeCluster {
            key: key.clone(),
            source,
        })?;
        Ok((spec, status))
    }

    /// The credential secret lives in the cluster's namespace.
    async fn credentials(
        &self,
        key: &ObjectKey,
        cluster: &Cluster,
        secret_ref: &str,
    ) -> MachineResult<Secret> {
        let secret_key = ObjectKey::new(cluster.namespace().unwrap_or_default(), secret_ref);
        self.store
            .get_secret(&secret_key)
            .await
            .map_err(|source| MachineError::Credentials {
                key: key.clone(),
                secret: secret_ref.to_string(),
                source,
            })
    }

    fn api_for(&self, key: &ObjectKey, secret: &Secret) -> MachineResult<Arc<dyn PacketApi>> {
        self.packet
            .from_secret(secret)
            .map_err(|source| MachineError::Client {
                key: key.clone(),
                source,
            })
    }

    /// Issue a device create for a machine that does not have one yet.
    ///
    /// The merged provider spec is written back before the remote call, so
    /// a crash between the two leaves a record that converges on retry. A
    /// machine that already carries a device id is left alone and
    /// re-checked later.
    #[instrument(skip_all, fields(name = %machine.name_any(), namespace = machine.namespace()))]
    pub async fn create(
        &self,
        cluster: Option<&Cluster>,
        machine: &Machine,
    ) -> MachineResult<(Action, DeviceCall)> {
        let key = ObjectKey::from_obj(machine);
        let cluster = Self::linked(&key, cluster)?;
        let (cluster_spec, cluster_status) = Self::cluster_payloads(&key, cluster)?;
        if cluster_status.project_id.is_empty() {
            return Err(MachineError::ClusterNotReady {
                key,
                cluster: cluster.name_any(),
            });
        }

        let mut spec: PacketMachineSpec =
            codec::decode_spec(machine).map_err(|source| MachineError::Decode {
                key: key.clone(),
                source,
            })?;
        let status: PacketMachineStatus =
            codec::decode_status(machine).map_err(|source| MachineError::Decode {
                key: key.clone(),
                source,
            })?;
        if !status.id.is_empty() {
            info!(device = %status.id, "machine already has a device, skipping create");
            return Ok((Action::requeue(PROVISION_RECHECK), DeviceCall::Skipped));
        }

        let secret = self.credentials(&key, cluster, &cluster_spec.secret_ref).await?;
        let api = self.api_for(&key, &secret)?;

        spec.project_id = cluster_status.project_id;
        spec.hostname = machine.name_any();
        spec.facility = cluster_spec.facility;
        spec.plan = cluster_spec.plan;
        spec.billing_cycle = cluster_spec.billing_cycle;
        if spec.os.is_empty() {
            spec.os = DEFAULT_OS.to_string();
        }
        store::update_provider_spec::<Machine, _>(self.store.as_ref(), &key, &spec, &self.retry)
            .await
            .map_err(|source| MachineError::PersistSpec {
                key: key.clone(),
                source,
            })?;

        let created = api
            .create_device(&spec)
            .await
            .map_err(|source| MachineError::CreateDevice {
                key: key.clone(),
                source,
            })?;
        store::update_provider_status::<Machine, _>(self.store.as_ref(), &key, &created, &self.retry)
            .await
            .map_err(|source| MachineError::PersistStatus {
                key: key.clone(),
                source,
            })?;

        info!(device = %created.id, state = %created.state, "created device");
        Ok((Action::requeue(PROVISION_RECHECK), DeviceCall::Issued))
    }

    /// Refresh the machine status from the remote device. A device removed
    /// out of band resets the status so the machine is provisioned again.
    #[instrument(skip_all, fields(name = %machine.name_any(), namespace = machine.namespace()))]
    pub async fn update(&self, cluster: Option<&Cluster>, machine: &Machine) -> MachineResult<Action> {
        let key = ObjectKey::from_obj(machine);
        let cluster = Self::linked(&key, cluster)?;
        let (cluster_spec, _) = Self::cluster_payloads(&key, cluster)?;
        let secret = self.credentials(&key, cluster, &cluster_spec.secret_ref).await?;
        let api = self.api_for(&key, &secret)?;

        let status: PacketMachineStatus =
            codec::decode_status(machine).map_err(|source| MachineError::Decode {
                key: key.clone(),
                source,
            })?;

        let observed = match api.get_device(&status.id).await {
            Ok(observed) => observed,
            Err(ApiError::DeviceNotFound(_)) => {
                info!(device = %status.id, "device is gone, resetting machine status");
                PacketMachineStatus::default()
            }
            Err(source) => {
                return Err(MachineError::GetDevice {
                    key,
                    device: status.id,
                    source,
                })
            }
        };

        store::update_provider_status::<Machine, _>(self.store.as_ref(), &key, &observed, &self.retry)
            .await
            .map_err(|source| MachineError::PersistStatus {
                key: key.clone(),
                source,
            })?;

        if observed.ready {
            Ok(Action::await_change())
        } else {
            debug!(state = %observed.state, "device not ready yet");
            Ok(Action::requeue(PROVISION_RECHECK))
        }
    }

    /// Release the backing device. A machine without a recorded device id
    /// has nothing to release; a device already gone remotely counts as
    /// released. The status is cleared afterwards either way.
    #[instrument(skip_all, fields(name = %machine.name_any(), namespace = machine.namespace()))]
    pub async fn delete(
        &self,
        cluster: Option<&Cluster>,
        machine: &Machine,
    ) -> MachineResult<(Action, DeviceCall)> {
        let key = ObjectKey::from_obj(machine);
        let status: PacketMachineStatus =
            codec::decode_status(machine).map_err(|source| MachineError::Decode {
                key: key.clone(),
                source,
            })?;
        if status.id.is_empty() {
            debug!("no device recorded, nothing to release");
            return Ok((Action::await_change(), DeviceCall::Skipped));
        }

        let cluster = Self::linked(&key, cluster)?;
        let (cluster_spec, _) = Self::cluster_payloads(&key, cluster)?;
        let secret = self.credentials(&key, cluster, &cluster_spec.secret_ref).await?;
        let api = self.api_for(&key, &secret)?;

        match api.delete_device(&status.id).await {
            Ok(()) => {}
            Err(ApiError::DeviceNotFound(_)) => {
                info!(device = %status.id, "device already gone")
            }
            Err(source) => {
                return Err(MachineError::DeleteDevice {
                    key,
                    device: status.id,
                    source,
                })
            }
        }

        store::update_provider_status::<Machine, _>(
            self.store.as_ref(),
            &key,
            &PacketMachineStatus::default(),
            &self.retry,
        )
        .await
        .map_err(|source| MachineError::PersistStatus {
            key: key.clone(),
            source,
        })?;

        info!(device = %status.id, "released device");
        Ok((Action::await_change(), DeviceCall::Issued))
    }

    /// Whether the machine's backing device exists remotely. A machine
    /// without a recorded device id does not exist by definition.
    #[instrument(skip_all, fields(name = %machine.name_any(), namespace = machine.namespace()))]
    pub async fn exists(&self, cluster: Option<&Cluster>, machine: &Machine) -> MachineResult<bool> {
        let key = ObjectKey::from_obj(machine);
        let cluster = Self::linked(&key, cluster)?;
        let (cluster_spec, _) = Self::cluster_payloads(&key, cluster)?;
        let secret = self.credentials(&key, cluster, &cluster_spec.secret_ref).await?;

        let status: PacketMachineStatus =
            codec::decode_status(machine).map_err(|source| MachineError::Decode {
                key: key.clone(),
                source,
            })?;
        if status.id.is_empty() {
            return Ok(false);
        }

        let api = self.api_for(&key, &secret)?;
        api.device_exists(&status.id)
            .await
            .map_err(|source| MachineError::CheckDevice {
                key,
                device: status.id.clone(),
                source,
            })
    }
}
