//! reqwest-backed adapter for the Packet REST API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::api::packet::{DeviceState, IpAddress, PacketMachineSpec, PacketMachineStatus};

use super::{api_key, ApiError, ApiResult, PacketApi, PacketApiFactory};

/// Public API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.packet.net";

/// Billing cycle applied when a machine spec does not pick one.
pub const DEFAULT_BILLING_CYCLE: &str = "hourly";

const AUTH_HEADER: &str = "X-Auth-Token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds [`PacketClient`]s against one API endpoint.
#[derive(Clone, Debug)]
pub struct PacketClientFactory {
    base_url: String,
}

impl PacketClientFactory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    /// Endpoint taken from `PACKET_API_URL`, falling back to the public
    /// API.
    pub fn from_env() -> Self {
        Self::new(std::env::var("PACKET_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string()))
    }
}

impl PacketApiFactory for PacketClientFactory {
    fn from_secret(&self, secret: &Secret) -> ApiResult<Arc<dyn PacketApi>> {
        Ok(Arc::new(PacketClient::new(&self.base_url, api_key(secret)?)?))
    }
}

/// Production [`PacketApi`] implementation. One instance per credential;
/// every request carries the token and a hard timeout.
pub struct PacketClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl PacketClient {
    pub fn new(base_url: &str, token: String) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(
        resp: reqwest::Response,
        not_found: impl FnOnce() -> ApiError,
    ) -> ApiResult<reqwest::Response> {
        match resp.status() {
            StatusCode::NOT_FOUND => Err(not_found()),
            status if status.is_success() => Ok(resp),
            status => {
                let message = resp.text().await.unwrap_or_default();
                Err(ApiError::Response { status, message })
            }
        }
    }
}

#[derive(Deserialize)]
struct ProjectList {
    #[serde(default)]
    projects: Vec<Project>,
}

#[derive(Deserialize)]
struct Project {
    id: String,
}

#[derive(Serialize)]
struct DeviceCreate {
    hostname: String,
    plan: String,
    facility: [String; 1],
    operating_system: String,
    billing_cycle: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    userdata: String,
}

#[derive(Deserialize)]
struct Device {
    id: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    ip_addresses: Vec<DeviceAddress>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DeviceAddress {
    id: String,
    address: String,
    gateway: String,
    network: String,
    address_family: i64,
    netmask: String,
    public: bool,
}

/// Map a wire device onto the status payload stored on machine records.
fn device_status(device: Device) -> PacketMachineStatus {
    let state = DeviceState::from(device.state.as_str());
    PacketMachineStatus {
        ready: state == DeviceState::Active,
        id: device.id,
        state,
        ip_addresses: device
            .ip_addresses
            .into_iter()
            .map(|addr| IpAddress {
                id: addr.id,
                address: addr.address,
                gateway: addr.gateway,
                network: addr.network,
                address_family: addr.address_family,
                netmask: addr.netmask,
                public: addr.public,
            })
            .collect(),
    }
}

/// Request body for a device create, with defaults applied.
fn create_body(spec: &PacketMachineSpec) -> DeviceCreate {
    DeviceCreate {
        hostname: spec.hostname.clone(),
        plan: spec.plan.clone(),
        facility: [spec.facility.clone()],
        operating_system: spec.os.clone(),
        billing_cycle: if spec.billing_cycle.is_empty() {
            DEFAULT_BILLING_CYCLE.to_string()
        } else {
            spec.billing_cycle.clone()
        },
        userdata: spec.user_data.clone(),
    }
}

#[async_trait]
impl PacketApi for PacketClient {
    async fn resolve_project_id(&self, project: &str) -> ApiResult<String> {
        let resp = self
            .http
            .get(self.url("/projects"))
            .header(AUTH_HEADER, &self.token)
            .query(&[("include", project)])
            .send()
            .await?;
        let resp = Self::check(resp, || ApiError::ProjectNotFound(project.to_string())).await?;
        let list: ProjectList = resp.json().await?;
        match list.projects.into_iter().next() {
            Some(first) => Ok(first.id),
            None => Err(ApiError::ProjectNotFound(project.to_string())),
        }
    }

    async fn create_device(&self, spec: &PacketMachineSpec) -> ApiResult<PacketMachineStatus> {
        let resp = self
            .http
            .post(self.url(&format!("/projects/{}/devices", spec.project_id)))
            .header(AUTH_HEADER, &self.token)
            .json(&create_body(spec))
            .send()
            .await?;
        let resp = Self::check(resp, || ApiError::ProjectNotFound(spec.project_id.clone())).await?;
        Ok(device_status(resp.json::<Device>().await?))
    }

    async fn get_device(&self, device_id: &str) -> ApiResult<PacketMachineStatus> {
        let resp = self
            .http
            .get(self.url(&format!("/devices/{device_id}")))
            .header(AUTH_HEADER, &self.token)
            .send()
            .await?;
        let resp = Self::check(resp, || ApiError::DeviceNotFound(device_id.to_string())).await?;
        Ok(device_status(resp.json::<Device>().await?))
    }

    async fn device_exists(&self, device_id: &str) -> ApiResult<bool> {
        match self.get_device(device_id).await {
            Ok(_) => Ok(true),
            Err(ApiError::DeviceNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn delete_device(&self, device_id: &str) -> ApiResult<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/devices/{device_id}")))
            .header(AUTH_HEADER, &self.token)
            .send()
            .await?;
        Self::check(resp, || ApiError::DeviceNotFound(device_id.to_string())).await?;
        Ok(())
    }
}
