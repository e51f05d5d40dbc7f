use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata key naming the encoding of a payload's bytes
pub const ENCODING_PAYLOAD_KEY: &str = "encoding";
/// Encoding used for every payload produced by [AsJsonPayloadExt]
pub const JSON_ENCODING_VAL: &str = "json/plain";

/// Opaque, encoded value crossing the workflow/host boundary. Activity arguments and results,
/// signal values, query arguments and results, child inputs and memo entries are all payloads.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub metadata: BTreeMap<String, Vec<u8>>,
    pub data: Vec<u8>,
}

impl Payload {
    /// A json `null`, used where a value is expected but none was supplied
    pub fn null() -> Self {
        Self::json_bytes(b"null".to_vec())
    }

    pub fn is_json_payload(&self) -> bool {
        self.metadata
            .get(ENCODING_PAYLOAD_KEY)
            .map(|v| v.as_slice() == JSON_ENCODING_VAL.as_bytes())
            .unwrap_or_default()
    }

    fn json_bytes(data: Vec<u8>) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(
            ENCODING_PAYLOAD_KEY.to_string(),
            JSON_ENCODING_VAL.as_bytes().to_vec(),
        );
        Self { metadata, data }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload is not json encoded")]
    NotJson,
    #[error("failed to serialize value: {0}")]
    Serialize(String),
    #[error("failed to deserialize payload: {0}")]
    Deserialize(String),
}

pub trait AsJsonPayloadExt {
    fn as_json_payload(&self) -> Result<Payload, PayloadError>;
}
impl<T> AsJsonPayloadExt for T
where
    T: Serialize + ?Sized,
{
    fn as_json_payload(&self) -> Result<Payload, PayloadError> {
        let as_json =
            serde_json::to_vec(self).map_err(|e| PayloadError::Serialize(e.to_string()))?;
        Ok(Payload::json_bytes(as_json))
    }
}

pub trait FromJsonPayloadExt: Sized {
    fn from_json_payload(payload: &Payload) -> Result<Self, PayloadError>;
}
impl<T> FromJsonPayloadExt for T
where
    T: DeserializeOwned,
{
    fn from_json_payload(payload: &Payload) -> Result<Self, PayloadError> {
        if !payload.is_json_payload() {
            return Err(PayloadError::NotJson);
        }
        serde_json::from_slice(&payload.data).map_err(|e| PayloadError::Deserialize(e.to_string()))
    }
}
