//! Test doubles shared across the crate's unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;

use crate::api::capi::{
    Cluster, ClusterSpec, ClusterStatus, Machine, MachineSpec, MachineStatus, CLUSTER_NAME_LABEL,
};
use crate::api::packet::{
    DeviceState, PacketClusterSpec, PacketClusterStatus, PacketMachineSpec, PacketMachineStatus,
};
use crate::codec;
use crate::packet::{api_key, ApiError, ApiResult, PacketApi, PacketApiFactory, API_KEY_SECRET_KEY};
use crate::store::{ObjectKey, ObjectStore, RetryConfig, SecretStore, StoreError, StoreResult};

/// Call journal shared between doubles, letting tests assert ordering
/// across the store and the device API.
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn records(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

/// Tight backoff keeping retry tests fast.
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 4,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
    }
}

/// In-memory resource store with write journaling and conflict injection.
pub struct MemoryStore {
    clusters: Mutex<HashMap<ObjectKey, Cluster>>,
    machines: Mutex<HashMap<ObjectKey, Machine>>,
    secrets: Mutex<HashMap<ObjectKey, Secret>>,
    conflicts: Mutex<u32>,
    journal: Journal,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_journal(journal())
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            clusters: Mutex::new(HashMap::new()),
            machines: Mutex::new(HashMap::new()),
            secrets: Mutex::new(HashMap::new()),
            conflicts: Mutex::new(0),
            journal,
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Make the next `n` writes fail with a conflict.
    pub fn fail_next_writes(&self, n: u32) {
        *self.conflicts.lock().unwrap() = n;
    }

    pub fn put_cluster(&self, cluster: Cluster) {
        self.clusters
            .lock()
            .unwrap()
            .insert(ObjectKey::from_obj(&cluster), cluster);
    }

    pub fn put_machine(&self, machine: Machine) {
        self.machines
            .lock()
            .unwrap()
            .insert(ObjectKey::from_obj(&machine), machine);
    }

    pub fn put_secret(&self, secret: Secret) {
        self.secrets
            .lock()
            .unwrap()
            .insert(ObjectKey::from_obj(&secret), secret);
    }

    pub fn cluster(&self, key: &ObjectKey) -> Option<Cluster> {
        self.clusters.lock().unwrap().get(key).cloned()
    }

    pub fn machine(&self, key: &ObjectKey) -> Option<Machine> {
        self.machines.lock().unwrap().get(key).cloned()
    }

    fn record(&self, entry: String) {
        self.journal.lock().unwrap().push(entry);
    }

    fn take_conflict(&self) -> bool {
        let mut conflicts = self.conflicts.lock().unwrap();
        if *conflicts > 0 {
            *conflicts -= 1;
            true
        } else {
            false
        }
    }

    fn write<K: Clone>(
        &self,
        map: &Mutex<HashMap<ObjectKey, K>>,
        kind: &str,
        verb: &str,
        key: ObjectKey,
        obj: &K,
    ) -> StoreResult<()> {
        if self.take_conflict() {
            self.record(format!("{verb}-conflict {key}"));
            return Err(StoreError::Conflict {
                kind: kind.to_string(),
                key,
            });
        }
        self.record(format!("{verb} {key}"));
        map.lock().unwrap().insert(key, obj.clone());
        Ok(())
    }
}

#[async_trait]
impl ObjectStore<Machine> for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Machine> {
        self.machines
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "Machine".to_string(),
                key: key.clone(),
            })
    }

    async fn update(&self, obj: &Machine) -> StoreResult<()> {
        self.write(
            &self.machines,
            "Machine",
            "machine-update",
            ObjectKey::from_obj(obj),
            obj,
        )
    }

    async fn update_status(&self, obj: &Machine) -> StoreResult<()> {
        self.write(
            &self.machines,
            "Machine",
            "machine-update-status",
            ObjectKey::from_obj(obj),
            obj,
        )
    }
}

#[async_trait]
impl ObjectStore<Cluster> for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Cluster> {
        self.clusters
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "Cluster".to_string(),
                key: key.clone(),
            })
    }

    async fn update(&self, obj: &Cluster) -> StoreResult<()> {
        self.write(
            &self.clusters,
            "Cluster",
            "cluster-update",
            ObjectKey::from_obj(obj),
            obj,
        )
    }

    async fn update_status(&self, obj: &Cluster) -> StoreResult<()> {
        self.write(
            &self.clusters,
            "Cluster",
            "cluster-update-status",
            ObjectKey::from_obj(obj),
            obj,
        )
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn get_secret(&self, key: &ObjectKey) -> StoreResult<Secret> {
        self.secrets
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "Secret".to_string(),
                key: key.clone(),
            })
    }
}

/// Canned device API recording every call in the journal.
pub struct FakePacketApi {
    projects: Mutex<HashMap<String, String>>,
    devices: Mutex<HashMap<String, PacketMachineStatus>>,
    next_id: Mutex<String>,
    last_create: Mutex<Option<PacketMachineSpec>>,
    journal: Journal,
}

impl FakePacketApi {
    pub fn new() -> Self {
        Self::with_journal(journal())
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            projects: Mutex::new(HashMap::new()),
            devices: Mutex::new(HashMap::new()),
            next_id: Mutex::new("d-fake".to_string()),
            last_create: Mutex::new(None),
            journal,
        }
    }

    pub fn add_project(&self, name: &str, id: &str) {
        self.projects
            .lock()
            .unwrap()
            .insert(name.to_string(), id.to_string());
    }

    /// Id handed to the next created device.
    pub fn set_next_id(&self, id: &str) {
        *self.next_id.lock().unwrap() = id.to_string();
    }

    pub fn add_device(&self, status: PacketMachineStatus) {
        self.devices.lock().unwrap().insert(status.id.clone(), status);
    }

    pub fn remove_device(&self, id: &str) {
        self.devices.lock().unwrap().remove(id);
    }

    pub fn has_device(&self, id: &str) -> bool {
        self.devices.lock().unwrap().contains_key(id)
    }

    pub fn last_create(&self) -> Option<PacketMachineSpec> {
        self.last_create.lock().unwrap().clone()
    }

    fn record(&self, entry: String) {
        self.journal.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl PacketApi for FakePacketApi {
    async fn resolve_project_id(&self, project: &str) -> ApiResult<String> {
        self.record(format!("resolve-project {project}"));
        self.projects
            .lock()
            .unwrap()
            .get(project)
            .cloned()
            .ok_or_else(|| ApiError::ProjectNotFound(project.to_string()))
    }

    async fn create_device(&self, spec: &PacketMachineSpec) -> ApiResult<PacketMachineStatus> {
        self.record(format!("create-device {}", spec.hostname));
        *self.last_create.lock().unwrap() = Some(spec.clone());
        let id = self.next_id.lock().unwrap().clone();
        let status = device(&id, DeviceState::Provisioning);
        self.devices.lock().unwrap().insert(id, status.clone());
        Ok(status)
    }

    async fn get_device(&self, device_id: &str) -> ApiResult<PacketMachineStatus> {
        self.record(format!("get-device {device_id}"));
        self.devices
            .lock()
            .unwrap()
            .get(device_id)
            .cloned()
            .ok_or_else(|| ApiError::DeviceNotFound(device_id.to_string()))
    }

    async fn device_exists(&self, device_id: &str) -> ApiResult<bool> {
        self.record(format!("exists-device {device_id}"));
        Ok(self.devices.lock().unwrap().contains_key(device_id))
    }

    async fn delete_device(&self, device_id: &str) -> ApiResult<()> {
        self.record(format!("delete-device {device_id}"));
        self.devices
            .lock()
            .unwrap()
            .remove(device_id)
            .map(|_| ())
            .ok_or_else(|| ApiError::DeviceNotFound(device_id.to_string()))
    }
}

/// Factory handing out one shared fake while still enforcing the
/// credential contract.
pub struct FakeFactory {
    pub api: Arc<FakePacketApi>,
}

impl PacketApiFactory for FakeFactory {
    fn from_secret(&self, secret: &Secret) -> ApiResult<Arc<dyn PacketApi>> {
        api_key(secret)?;
        Ok(self.api.clone())
    }
}

pub fn api_secret(namespace: &str, name: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(
            [(
                API_KEY_SECRET_KEY.to_string(),
                ByteString(b"test-token".to_vec()),
            )]
            .into_iter()
            .collect(),
        ),
        ..Default::default()
    }
}

pub fn empty_secret(namespace: &str, name: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn cluster(
    namespace: &str,
    name: &str,
    spec: &PacketClusterSpec,
    status: Option<&PacketClusterStatus>,
) -> Cluster {
    let mut cluster = Cluster::new(
        name,
        ClusterSpec {
            provider_spec: Some(codec::encode(spec).unwrap()),
        },
    );
    cluster.metadata.namespace = Some(namespace.to_string());
    cluster.status = status.map(|status| ClusterStatus {
        provider_status: Some(codec::encode(status).unwrap()),
    });
    cluster
}

pub fn machine(
    namespace: &str,
    name: &str,
    cluster: &str,
    spec: Option<&PacketMachineSpec>,
    status: Option<&PacketMachineStatus>,
) -> Machine {
    let mut machine = Machine::new(
        name,
        MachineSpec {
            provider_spec: spec.map(|spec| codec::encode(spec).unwrap()),
        },
    );
    machine.metadata.namespace = Some(namespace.to_string());
    machine.metadata.labels = Some(
        [(CLUSTER_NAME_LABEL.to_string(), cluster.to_string())]
            .into_iter()
            .collect(),
    );
    machine.status = status.map(|status| MachineStatus {
        provider_status: Some(codec::encode(status).unwrap()),
    });
    machine
}

/// Observed device state the way the remote API reports it.
pub fn device(id: &str, state: DeviceState) -> PacketMachineStatus {
    PacketMachineStatus {
        ready: state == DeviceState::Active,
        id: id.to_string(),
        state,
        ip_addresses: Vec::new(),
    }
}
