use crate::error::DomainError;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub fn uuid_v7_without_dashes() -> String {
    Uuid::now_v7().simple().to_string()
}

/// SHA-256 over the JSON encoding of an audit payload.
pub fn immutable_event_hash<T>(value: &T) -> crate::DomainResult<String>
where
    T: Serialize,
{
    let payload = serde_json::to_vec(value).map_err(|err| {
        DomainError::Validation(format!("failed to serialize audit payload: {err}"))
    })?;
    let digest = Sha256::digest(&payload);
    Ok(hex::encode(digest))
}

/// Float equality tolerant of summation order.
pub fn approx_eq(left: f64, right: f64) -> bool {
    (left - right).abs() <= 1e-6 * left.abs().max(right.abs()).max(1.0)
}
