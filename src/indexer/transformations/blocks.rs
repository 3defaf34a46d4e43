use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::models::datasets::blocks::{CanonicalBlock, IssuerDescriptor, RawBlockPayload};
use crate::models::errors::PayloadError;
use crate::utils::truncate_to_seconds;

pub const UNKNOWN_ISSUER: &str = "unknown";

const BLOCK_ID_KEYS: [&str; 2] = ["id", "hash"];
const POOL_ID_KEYS: [&str; 3] = ["poolId", "pool_id", "pool"];
const VRF_KEY_KEYS: [&str; 3] = ["vrfVerificationKey", "vrf_vkey", "vrfKey"];
const OUTPUT_VALUE_KEYS: [&str; 2] = ["value", "amount"];

pub trait BlockTransformer {
    fn transform_block(&self, observed_at: DateTime<Utc>) -> Result<CanonicalBlock, PayloadError>;
}

impl BlockTransformer for RawBlockPayload {
    fn transform_block(&self, observed_at: DateTime<Utc>) -> Result<CanonicalBlock, PayloadError> {
        normalize(self, observed_at)
    }
}

/// Convert one raw payload into a canonical block.
///
/// `observed_at` is the ingestion wall-clock; it becomes `date_time` after
/// truncation to whole seconds. Nothing in the payload is used as a timestamp.
pub fn normalize(
    payload: &RawBlockPayload,
    observed_at: DateTime<Utc>,
) -> Result<CanonicalBlock, PayloadError> {
    let block = payload
        .0
        .as_object()
        .ok_or_else(|| PayloadError::invalid("block", "is not an object"))?;

    let block_id = block_id(block)?;
    let block_height = optional_u64(block, "height")?;
    let block_slot = optional_u64(block, "slot")?;
    let block_size = block_size(block)?;

    let transactions = block
        .get("transactions")
        .ok_or_else(|| PayloadError::missing("transactions"))?
        .as_array()
        .ok_or_else(|| PayloadError::invalid("transactions", "is not an array"))?;

    // Summation and counting walk the same list so tx_count always matches the sums
    let mut ada_output: u64 = 0;
    let mut fees: u64 = 0;
    let mut tx_count: u64 = 0;
    for (index, tx) in transactions.iter().enumerate() {
        let (tx_fee, tx_output) = transaction_amounts(index, tx)?;
        fees = fees
            .checked_add(tx_fee)
            .ok_or_else(|| PayloadError::invalid("fees", "overflows 64 bits"))?;
        ada_output = ada_output
            .checked_add(tx_output)
            .ok_or_else(|| PayloadError::invalid("ada_output", "overflows 64 bits"))?;
        tx_count += 1;
    }

    let issuer = normalize_issuer(&IssuerDescriptor::from_value(block.get("issuer")));

    Ok(CanonicalBlock {
        block_id,
        block_height,
        block_slot,
        block_size,
        issuer,
        tx_count,
        ada_output,
        fees,
        date_time: truncate_to_seconds(observed_at),
    })
}

/// Resolve an issuer descriptor to a single identifier.
///
/// Precedence for structured credentials: pool id, then VRF key, then the
/// whole credential serialized as JSON.
pub fn normalize_issuer(descriptor: &IssuerDescriptor) -> String {
    match descriptor {
        IssuerDescriptor::Absent => UNKNOWN_ISSUER.to_string(),
        IssuerDescriptor::PlainString(issuer) => issuer.clone(),
        IssuerDescriptor::StructuredCredential(credential) => first_present(credential, &POOL_ID_KEYS)
            .or_else(|| first_present(credential, &VRF_KEY_KEYS))
            .map(value_to_identifier)
            .unwrap_or_else(|| Value::Object(credential.clone()).to_string()),
        IssuerDescriptor::Other(value) => value.to_string(),
    }
}

fn first_present<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| map.get(*key))
        .find(|value| !value.is_null())
}

fn value_to_identifier(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn block_id(block: &Map<String, Value>) -> Result<String, PayloadError> {
    let value = first_present(block, &BLOCK_ID_KEYS).ok_or_else(|| PayloadError::missing("id"))?;
    match value {
        Value::String(id) if !id.trim().is_empty() => Ok(id.clone()),
        Value::String(_) => Err(PayloadError::invalid("id", "is empty")),
        _ => Err(PayloadError::invalid("id", "is not a string")),
    }
}

fn optional_u64(block: &Map<String, Value>, field: &str) -> Result<u64, PayloadError> {
    match block.get(field) {
        None | Some(Value::Null) => Ok(0),
        Some(value) => as_u64(value).ok_or_else(|| {
            PayloadError::invalid(field, format!("is not an unsigned integer: {value}"))
        }),
    }
}

fn block_size(block: &Map<String, Value>) -> Result<u64, PayloadError> {
    match block.get("size") {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Object(size)) => size
            .get("bytes")
            .and_then(as_u64)
            .ok_or_else(|| PayloadError::invalid("size", "has no numeric 'bytes' field")),
        Some(value) => as_u64(value)
            .ok_or_else(|| PayloadError::invalid("size", format!("is not an unsigned integer: {value}"))),
    }
}

/// Returns (fee, sum of outputs) for one transaction, in lovelace.
fn transaction_amounts(index: usize, tx: &Value) -> Result<(u64, u64), PayloadError> {
    let tx = tx
        .as_object()
        .ok_or_else(|| PayloadError::invalid(format!("transactions[{index}]"), "is not an object"))?;

    let fee = match tx.get("fee") {
        None | Some(Value::Null) => 0,
        Some(fee) => lovelace(fee)
            .ok_or_else(|| PayloadError::invalid(format!("transactions[{index}].fee"), "is not numeric"))?,
    };

    let outputs = match tx.get("outputs") {
        None | Some(Value::Null) => return Ok((fee, 0)),
        Some(Value::Array(outputs)) => outputs,
        Some(_) => {
            return Err(PayloadError::invalid(
                format!("transactions[{index}].outputs"),
                "is not an array",
            ));
        }
    };

    let mut output_total: u64 = 0;
    for (output_index, output) in outputs.iter().enumerate() {
        let field = format!("transactions[{index}].outputs[{output_index}].value");
        let value = output
            .as_object()
            .and_then(|output| first_present(output, &OUTPUT_VALUE_KEYS))
            .ok_or_else(|| PayloadError::missing(field.clone()))?;
        let amount = lovelace(value).ok_or_else(|| PayloadError::invalid(field.clone(), "is not numeric"))?;
        output_total = output_total
            .checked_add(amount)
            .ok_or_else(|| PayloadError::invalid(field, "overflows 64 bits"))?;
    }

    Ok((fee, output_total))
}

/// Accepts `n`, `"n"`, `{"lovelace": n}` and `{"ada": {"lovelace": n}}`.
fn lovelace(value: &Value) -> Option<u64> {
    match value {
        Value::Object(map) => {
            if let Some(amount) = map.get("lovelace") {
                as_u64(amount)
            } else {
                map.get("ada").and_then(lovelace)
            }
        }
        other => as_u64(other),
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}
