use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

////////////////////////////////////// Raw Data ////////////////////////////////////////

/// One decoded block as delivered by the upstream chain-sync feed.
///
/// The payload is kept semi-structured; the normalizer is responsible for
/// pulling out the fields it needs and rejecting payloads of the wrong shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawBlockPayload(pub Value);

impl From<Value> for RawBlockPayload {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Shape of the `issuer` field of a raw block.
#[derive(Debug, Clone, PartialEq)]
pub enum IssuerDescriptor {
    Absent,
    PlainString(String),
    StructuredCredential(Map<String, Value>),
    Other(Value),
}

impl IssuerDescriptor {
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::Absent,
            Some(Value::String(issuer)) => Self::PlainString(issuer.clone()),
            Some(Value::Object(credential)) => Self::StructuredCredential(credential.clone()),
            Some(other) => Self::Other(other.clone()),
        }
    }
}

/////////////////////////////////// Transformed Data ///////////////////////////////////

/// Canonical, storage-ready representation of one chain block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalBlock {
    pub block_id: String,
    pub block_height: u64,
    pub block_slot: u64,
    pub block_size: u64,
    pub issuer: String,
    pub tx_count: u64,
    pub ada_output: u64, // lovelace
    pub fees: u64,       // lovelace
    pub date_time: DateTime<Utc>,
}

/// A canonical block as it exists in the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlock {
    #[serde(flatten)] // Flatten nested structs
    pub block: CanonicalBlock,
    pub inserted_at: DateTime<Utc>,
}

/// Event pushed to live subscribers for every ingested block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEvent {
    pub event: String,
    pub block: CanonicalBlock,
    pub is_real_time: bool,
}

impl BlockEvent {
    pub fn new_block(block: CanonicalBlock, is_real_time: bool) -> Self {
        Self {
            event: "new_block".to_string(),
            block,
            is_real_time,
        }
    }
}
