use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub type CodecResult<T> = std::result::Result<T, CodecError>;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed provider payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("serialize provider payload: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Typed access to the opaque payloads a provider maintains on a generic
/// resource record.
pub trait ProviderResource: Clone + Send + Sync + 'static {
    const KIND: &'static str;
    type ProviderSpec: Serialize + DeserializeOwned + Default + PartialEq + Send + Sync;
    type ProviderStatus: Serialize + DeserializeOwned + Default + PartialEq + Send + Sync;

    fn provider_spec(&self) -> Option<&RawExtension>;
    fn provider_spec_mut(&mut self) -> &mut Option<RawExtension>;
    fn provider_status(&self) -> Option<&RawExtension>;
    fn provider_status_mut(&mut self) -> &mut Option<RawExtension>;
}

/// Decode an opaque payload into its typed form. An absent or null payload
/// is the zero value of the target; a malformed one is an error, never
/// silently defaulted.
pub fn decode<T>(raw: Option<&RawExtension>) -> CodecResult<T>
where
    T: DeserializeOwned + Default,
{
    match raw {
        None => Ok(T::default()),
        Some(raw) if raw.0.is_null() => Ok(T::default()),
        Some(raw) => serde_json::from_value(raw.0.clone()).map_err(CodecError::Decode),
    }
}

pub fn encode<T: Serialize>(value: &T) -> CodecResult<RawExtension> {
    Ok(RawExtension(
        serde_json::to_value(value).map_err(CodecError::Encode)?,
    ))
}

pub fn decode_spec<K: ProviderResource>(obj: &K) -> CodecResult<K::ProviderSpec> {
    decode(obj.provider_spec())
}

pub fn decode_status<K: ProviderResource>(obj: &K) -> CodecResult<K::ProviderStatus> {
    decode(obj.provider_status())
}
