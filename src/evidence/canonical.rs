//! Canonical JSON and digests

use crate::error::AppError;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Recursively order object keys
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut canonical = serde_json::Map::new();
            for key in keys {
                if let Some(inner) = map.get(key) {
                    canonical.insert(key.clone(), canonicalize(inner));
                }
            }
            Value::Object(canonical)
        }
        Value::Array(values) => Value::Array(values.iter().map(canonicalize).collect()),
        _ => value.clone(),
    }
}

/// Compact sorted-key serialization of any serializable value
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, AppError> {
    let value = serde_json::to_value(value)
        .map_err(|e| AppError::Internal(format!("Failed to serialize evidence: {}", e)))?;
    serde_json::to_string(&canonicalize(&value))
        .map_err(|e| AppError::Internal(format!("Failed to serialize evidence: {}", e)))
}

pub fn sha256_hex(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

pub fn hmac_hex(payload: &str, key: &str) -> Result<String, AppError> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| AppError::Internal(format!("hmac init failed: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn verify_hmac_hex(payload: &str, signature_hex: &str, key: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key.as_bytes()) else {
        return false;
    };
    mac.update(payload.as_bytes());
    mac.verify_slice(&signature).is_ok()
}
