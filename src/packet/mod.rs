//! Capability-scoped access to the Packet device API.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use thiserror::Error;

use crate::api::packet::{PacketMachineSpec, PacketMachineStatus};

mod client;
pub use client::{PacketClient, PacketClientFactory, DEFAULT_API_URL, DEFAULT_BILLING_CYCLE};

/// Key inside a credential secret holding the API token.
pub const API_KEY_SECRET_KEY: &str = "apiKey";

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("no project matches {0:?}")]
    ProjectNotFound(String),

    #[error("secret {secret} does not contain key apiKey")]
    MissingApiKey { secret: String },

    #[error("secret {secret} key apiKey is not valid UTF-8")]
    InvalidApiKey { secret: String },

    #[error("packet api request: {0}")]
    Request(#[from] reqwest::Error),

    #[error("packet api returned {status}: {message}")]
    Response {
        status: reqwest::StatusCode,
        message: String,
    },
}

/// Device-level operations the actuators need from the provisioning
/// service. One production implementation exists ([`PacketClient`]); tests
/// substitute their own.
#[async_trait]
pub trait PacketApi: Send + Sync {
    /// Resolve a project name to its id. The first match wins when the
    /// remote filter returns several.
    async fn resolve_project_id(&self, project: &str) -> ApiResult<String>;

    /// Issue a device create and return the mapped observed state. The
    /// remote operation is asynchronous; the returned state is usually
    /// still provisioning.
    async fn create_device(&self, spec: &PacketMachineSpec) -> ApiResult<PacketMachineStatus>;

    async fn get_device(&self, device_id: &str) -> ApiResult<PacketMachineStatus>;

    async fn device_exists(&self, device_id: &str) -> ApiResult<bool>;

    async fn delete_device(&self, device_id: &str) -> ApiResult<()>;
}

/// Builds authenticated [`PacketApi`] handles from credential secrets.
pub trait PacketApiFactory: Send + Sync {
    fn from_secret(&self, secret: &Secret) -> ApiResult<Arc<dyn PacketApi>>;
}

/// Extract the API token from a credential secret.
pub fn api_key(secret: &Secret) -> ApiResult<String> {
    let name = secret.metadata.name.clone().unwrap_or_default();
    let data = secret
        .data
        .as_ref()
        .and_then(|data| data.get(API_KEY_SECRET_KEY))
        .ok_or_else(|| ApiError::MissingApiKey {
            secret: name.clone(),
        })?;
    String::from_utf8(data.0.clone()).map_err(|_| ApiError::InvalidApiKey { secret: name })
}
