use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::packet::{
    PacketClusterSpec, PacketClusterStatus, PacketMachineSpec, PacketMachineStatus,
};
use crate::codec::ProviderResource;

/// Label linking a machine to the cluster that owns it.
pub const CLUSTER_NAME_LABEL: &str = "cluster.k8s.io/cluster-name";

/// Generic cluster record. The provider-specific configuration travels in
/// the opaque `providerSpec` payload, provider-observed state in
/// `providerStatus`.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_extension_schema")]
    pub provider_spec: Option<RawExtension>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_extension_schema")]
    pub provider_status: Option<RawExtension>,
}

/// Generic machine record, linked to its owning cluster by the
/// [`CLUSTER_NAME_LABEL`] label.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Machine",
    namespaced,
    status = "MachineStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_extension_schema")]
    pub provider_spec: Option<RawExtension>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_extension_schema")]
    pub provider_status: Option<RawExtension>,
}

// Opaque payloads validate as free-form objects.
fn raw_extension_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    let mut schema = schemars::schema::SchemaObject {
        instance_type: Some(schemars::schema::InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::json!(true),
    );
    schemars::schema::Schema::Object(schema)
}

impl Machine {
    /// Name of the cluster this machine belongs to, when labeled.
    pub fn cluster_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()?
            .get(CLUSTER_NAME_LABEL)
            .map(String::as_str)
    }
}

impl ProviderResource for Cluster {
    const KIND: &'static str = "Cluster";
    type ProviderSpec = PacketClusterSpec;
    type ProviderStatus = PacketClusterStatus;

    fn provider_spec(&self) -> Option<&RawExtension> {
        self.spec.provider_spec.as_ref()
    }

    fn provider_spec_mut(&mut self) -> &mut Option<RawExtension> {
        &mut self.spec.provider_spec
    }

    fn provider_status(&self) -> Option<&RawExtension> {
        self.status.as_ref()?.provider_status.as_ref()
    }

    fn provider_status_mut(&mut self) -> &mut Option<RawExtension> {
        &mut self
            .status
            .get_or_insert_with(ClusterStatus::default)
            .provider_status
    }
}

impl ProviderResource for Machine {
    const KIND: &'static str = "Machine";
    type ProviderSpec = PacketMachineSpec;
    type ProviderStatus = PacketMachineStatus;

    fn provider_spec(&self) -> Option<&RawExtension> {
        self.spec.provider_spec.as_ref()
    }

    fn provider_spec_mut(&mut self) -> &mut Option<RawExtension> {
        &mut self.spec.provider_spec
    }

    fn provider_status(&self) -> Option<&RawExtension> {
        self.status.as_ref()?.provider_status.as_ref()
    }

    fn provider_status_mut(&mut self) -> &mut Option<RawExtension> {
        &mut self
            .status
            .get_or_insert_with(MachineStatus::default)
            .provider_status
    }
}
