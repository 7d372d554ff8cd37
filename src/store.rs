use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, PostParams},
    client::Client,
    Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::codec::{self, CodecError, CodecResult, ProviderResource};

/// Namespace/name pair identifying a resource record.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_obj(obj: &impl ResourceExt) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: ObjectKey },

    #[error("conflicting write to {kind} {key}")]
    Conflict { kind: String, key: ObjectKey },

    #[error("api: {0}")]
    Kube(#[source] kube::Error),
}

impl StoreError {
    fn from_kube(kind: &str, key: &ObjectKey, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound {
                kind: kind.to_string(),
                key: key.clone(),
            },
            kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict {
                kind: kind.to_string(),
                key: key.clone(),
            },
            other => StoreError::Kube(other),
        }
    }
}

/// Read and conditionally write one kind of resource record. Writes carry
/// the read resource version and fail with [`StoreError::Conflict`] when the
/// stored record moved underneath.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> StoreResult<K>;
    async fn update(&self, obj: &K) -> StoreResult<()>;
    async fn update_status(&self, obj: &K) -> StoreResult<()>;
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, key: &ObjectKey) -> StoreResult<Secret>;
}

/// Stores backed by the kube API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    K: Clone + Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> StoreResult<K> {
        self.api::<K>(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| StoreError::from_kube(&K::kind(&()), key, e))
    }

    async fn update(&self, obj: &K) -> StoreResult<()> {
        let key = ObjectKey::from_obj(obj);
        self.api::<K>(&key.namespace)
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| StoreError::from_kube(&K::kind(&()), &key, e))?;
        Ok(())
    }

    async fn update_status(&self, obj: &K) -> StoreResult<()> {
        let key = ObjectKey::from_obj(obj);
        let data = serde_json::to_vec(obj)
            .map_err(kube::Error::SerdeError)
            .map_err(StoreError::Kube)?;
        self.api::<K>(&key.namespace)
            .replace_status(&key.name, &PostParams::default(), data)
            .await
            .map_err(|e| StoreError::from_kube(&K::kind(&()), &key, e))?;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for KubeStore {
    async fn get_secret(&self, key: &ObjectKey) -> StoreResult<Secret> {
        self.api::<Secret>(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| StoreError::from_kube("Secret", key, e))
    }
}

/// Backoff envelope for optimistic-concurrency retries.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 5.0,
        }
    }
}

/// Outcome of a conditional payload update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Persisted {
    /// The stored payload already matched; no write was issued.
    Unchanged,
    /// A write was issued and accepted.
    Written,
}

pub type UpdateResult<T> = std::result::Result<T, UpdateError>;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("update of {kind} {key} still conflicting after {attempts} attempts")]
    Conflict {
        kind: String,
        key: ObjectKey,
        attempts: u32,
    },
}

/// Replace the provider spec payload of the record at `key` with `spec`,
/// re-reading and retrying on conflicting writes. Equal payloads issue no
/// write at all.
pub async fn update_provider_spec<K, S>(
    store: &S,
    key: &ObjectKey,
    spec: &K::ProviderSpec,
    retry: &RetryConfig,
) -> UpdateResult<Persisted>
where
    K: ProviderResource,
    S: ObjectStore<K> + ?Sized,
{
    read_modify_write(store, key, retry, Write::Resource, |obj: &mut K| {
        let current: K::ProviderSpec = codec::decode(obj.provider_spec())?;
        if current == *spec {
            return Ok(false);
        }
        *obj.provider_spec_mut() = Some(codec::encode(spec)?);
        Ok(true)
    })
    .await
}

/// Status-subresource counterpart of [`update_provider_spec`].
pub async fn update_provider_status<K, S>(
    store: &S,
    key: &ObjectKey,
    status: &K::ProviderStatus,
    retry: &RetryConfig,
) -> UpdateResult<Persisted>
where
    K: ProviderResource,
    S: ObjectStore<K> + ?Sized,
{
    read_modify_write(store, key, retry, Write::Status, |obj: &mut K| {
        let current: K::ProviderStatus = codec::decode(obj.provider_status())?;
        if current == *status {
            return Ok(false);
        }
        *obj.provider_status_mut() = Some(codec::encode(status)?);
        Ok(true)
    })
    .await
}

/// Which write verb a conditional update goes through.
#[derive(Clone, Copy)]
enum Write {
    Resource,
    Status,
}

async fn read_modify_write<K, S, M>(
    store: &S,
    key: &ObjectKey,
    retry: &RetryConfig,
    write: Write,
    mutate: M,
) -> UpdateResult<Persisted>
where
    K: ProviderResource,
    S: ObjectStore<K> + ?Sized,
    M: Fn(&mut K) -> CodecResult<bool> + Send,
{
    let mut delay = retry.initial_delay;
    let mut attempts = 0;
    loop {
        attempts += 1;
        let mut latest = store.get(key).await?;
        if !mutate(&mut latest)? {
            return Ok(Persisted::Unchanged);
        }
        let written = match write {
            Write::Resource => store.update(&latest).await,
            Write::Status => store.update_status(&latest).await,
        };
        match written {
            Ok(()) => return Ok(Persisted::Written),
            Err(StoreError::Conflict { .. }) if attempts < retry.max_attempts => {
                debug!(%key, attempts, "conflicting write, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(retry.backoff_multiplier).min(retry.max_delay);
            }
            Err(StoreError::Conflict { .. }) => {
                return Err(UpdateError::Conflict {
                    kind: K::KIND.to_string(),
                    key: key.clone(),
                    attempts,
                })
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::capi::Machine;
    use crate::api::packet::{DeviceState, PacketMachineStatus};
    use crate::fixtures::{self, MemoryStore};

    fn machine_key() -> ObjectKey {
        ObjectKey::new("default", "m-1")
    }

    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.put_machine(fixtures::machine("default", "m-1", "test-1", None, None));
        store
    }

    #[test]
    fn object_key_displays_as_namespaced_name() {
        assert_eq!(machine_key().to_string(), "default/m-1");
    }

    #[tokio::test]
    async fn equal_payload_issues_no_write() {
        let store = seeded_store();
        let status = PacketMachineStatus::default();

        let persisted = update_provider_status::<Machine, _>(
            &store,
            &machine_key(),
            &status,
            &fixtures::fast_retry(),
        )
        .await
        .unwrap();

        assert_eq!(persisted, Persisted::Unchanged);
        assert!(fixtures::records(store.journal()).is_empty());
    }

    #[tokio::test]
    async fn conflicting_write_is_retried_once_and_succeeds() {
        let store = seeded_store();
        store.fail_next_writes(1);
        let status = PacketMachineStatus {
            id: "d1".into(),
            state: DeviceState::Provisioning,
            ..Default::default()
        };

        let persisted = update_provider_status::<Machine, _>(
            &store,
            &machine_key(),
            &status,
            &fixtures::fast_retry(),
        )
        .await
        .unwrap();

        assert_eq!(persisted, Persisted::Written);
        let machine = store.machine(&machine_key()).unwrap();
        let stored: PacketMachineStatus = codec::decode_status(&machine).unwrap();
        assert_eq!(stored, status);
        // one rejected attempt, one accepted
        assert_eq!(
            fixtures::records(store.journal()),
            vec![
                "machine-update-status-conflict default/m-1",
                "machine-update-status default/m-1",
            ]
        );
    }

    #[tokio::test]
    async fn exhausted_conflict_retries_surface() {
        let store = seeded_store();
        store.fail_next_writes(10);
        let status = PacketMachineStatus {
            id: "d1".into(),
            ..Default::default()
        };

        let err = update_provider_status::<Machine, _>(
            &store,
            &machine_key(),
            &status,
            &fixtures::fast_retry(),
        )
        .await
        .unwrap_err();

        match err {
            UpdateError::Conflict { kind, attempts, .. } => {
                assert_eq!(kind, "Machine");
                assert_eq!(attempts, 4);
            }
            other => panic!("expected conflict exhaustion, got {other:?}"),
        }
        let machine = store.machine(&machine_key()).unwrap();
        assert!(machine.status.is_none());
    }

    #[tokio::test]
    async fn malformed_stored_payload_fails_the_update() {
        let store = MemoryStore::new();
        let mut machine = fixtures::machine("default", "m-1", "test-1", None, None);
        machine.status = Some(crate::api::capi::MachineStatus {
            provider_status: Some(k8s_openapi::apimachinery::pkg::runtime::RawExtension(
                serde_json::json!(["not", "a", "status"]),
            )),
        });
        store.put_machine(machine);

        let err = update_provider_status::<Machine, _>(
            &store,
            &machine_key(),
            &PacketMachineStatus::default(),
            &fixtures::fast_retry(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, UpdateError::Codec(CodecError::Decode(_))));
        assert!(fixtures::records(store.journal()).is_empty());
    }

    #[tokio::test]
    async fn missing_record_surfaces_not_found() {
        let store = MemoryStore::new();
        let err = update_provider_status::<Machine, _>(
            &store,
            &machine_key(),
            &PacketMachineStatus::default(),
            &fixtures::fast_retry(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            UpdateError::Store(StoreError::NotFound { .. })
        ));
    }
}
