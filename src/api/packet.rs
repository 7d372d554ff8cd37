use std::fmt;

use serde::{Deserialize, Serialize};

/// Provider configuration carried by a cluster record.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct PacketClusterSpec {
    /// Human-readable name of the Packet project backing this cluster.
    pub project: String,
    pub facility: String,
    pub plan: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub billing_cycle: String,
    /// Name of the secret holding the API credential, in the cluster's
    /// namespace.
    pub secret_ref: String,
}

/// Provider-observed state carried by a cluster record.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct PacketClusterStatus {
    /// Set once the project name resolved against the remote API.
    #[serde(rename = "projectID", skip_serializing_if = "String::is_empty")]
    pub project_id: String,
}

/// Provider configuration carried by a machine record. Written back by the
/// actuator once cluster-derived fields are merged in.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct PacketMachineSpec {
    #[serde(rename = "projectID")]
    pub project_id: String,
    pub facility: String,
    pub plan: String,
    pub hostname: String,
    pub os: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub billing_cycle: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_data: String,
}

/// Provider-observed state carried by a machine record.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct PacketMachineStatus {
    /// True once the backing device reached the `active` state.
    pub ready: bool,
    /// Remote device id; empty until a device was created.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub state: DeviceState,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<IpAddress>,
}

/// Lifecycle state of a remote device. Unrecognized states map to
/// [`DeviceState::Unknown`] rather than failing the decode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceState {
    Active,
    Inactive,
    Queued,
    Provisioning,
    #[default]
    Unknown,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Active => "active",
            DeviceState::Inactive => "inactive",
            DeviceState::Queued => "queued",
            DeviceState::Provisioning => "provisioning",
            DeviceState::Unknown => "unknown",
        }
    }
}

impl From<&str> for DeviceState {
    fn from(s: &str) -> Self {
        match s {
            "active" => DeviceState::Active,
            "inactive" => DeviceState::Inactive,
            "queued" => DeviceState::Queued,
            "provisioning" => DeviceState::Provisioning,
            _ => DeviceState::Unknown,
        }
    }
}

impl From<String> for DeviceState {
    fn from(s: String) -> Self {
        s.as_str().into()
    }
}

impl From<DeviceState> for String {
    fn from(state: DeviceState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One address assigned to a device.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct IpAddress {
    pub id: String,
    pub address: String,
    pub gateway: String,
    pub network: String,
    /// 4 or 6.
    pub address_family: i64,
    pub netmask: String,
    pub public: bool,
}
