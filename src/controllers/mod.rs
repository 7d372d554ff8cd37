use thiserror::Error;

use crate::codec::CodecError;
use crate::packet::ApiError;
use crate::store::{ObjectKey, StoreError, UpdateError};

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Failures of one cluster reconciliation step, each carrying the identity
/// of the cluster it happened on.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("decode provider payload of cluster {key}: {source}")]
    Decode {
        key: ObjectKey,
        #[source]
        source: CodecError,
    },

    #[error("get credential secret {secret} for cluster {key}: {source}")]
    Credentials {
        key: ObjectKey,
        secret: String,
        #[source]
        source: StoreError,
    },

    #[error("build packet client for cluster {key}: {source}")]
    Client {
        key: ObjectKey,
        #[source]
        source: ApiError,
    },

    #[error("resolve project {project:?} for cluster {key}: {source}")]
    ResolveProject {
        key: ObjectKey,
        project: String,
        #[source]
        source: ApiError,
    },

    #[error("persist status of cluster {key}: {source}")]
    PersistStatus {
        key: ObjectKey,
        #[source]
        source: UpdateError,
    },
}

pub type MachineResult<T> = std::result::Result<T, MachineError>;

/// Failures of one machine lifecycle operation.
#[derive(Error, Debug)]
pub enum MachineError {
    #[error("machine {key} is not linked to a cluster")]
    MissingCluster { key: ObjectKey },

    #[error("cluster {cluster} of machine {key} has not resolved its project id yet")]
    ClusterNotReady { key: ObjectKey, cluster: String },

    #[error("decode cluster provider payload for machine {key}: {source}")]
    DecodeCluster {
        key: ObjectKey,
        #[source]
        source: CodecError,
    },

    #[error("decode provider payload of machine {key}: {source}")]
    Decode {
        key: ObjectKey,
        #[source]
        source: CodecError,
    },

    #[error("get credential secret {secret} for machine {key}: {source}")]
    Credentials {
        key: ObjectKey,
        secret: String,
        #[source]
        source: StoreError,
    },

    #[error("build packet client for machine {key}: {source}")]
    Client {
        key: ObjectKey,
        #[source]
        source: ApiError,
    },

    #[error("create device for machine {key}: {source}")]
    CreateDevice {
        key: ObjectKey,
        #[source]
        source: ApiError,
    },

    #[error("get device {device} for machine {key}: {source}")]
    GetDevice {
        key: ObjectKey,
        device: String,
        #[source]
        source: ApiError,
    },

    #[error("check device {device} for machine {key}: {source}")]
    CheckDevice {
        key: ObjectKey,
        device: String,
        #[source]
        source: ApiError,
    },

    #[error("delete device {device} for machine {key}: {source}")]
    DeleteDevice {
        key: ObjectKey,
        device: String,
        #[source]
        source: ApiError,
    },

    #[error("persist spec of machine {key}: {source}")]
    PersistSpec {
        key: ObjectKey,
        #[source]
        source: UpdateError,
    },

    #[error("persist status of machine {key}: {source}")]
    PersistStatus {
        key: ObjectKey,
        #[source]
        source: UpdateError,
    },
}

pub mod cluster;
pub mod machine;
