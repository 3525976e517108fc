//! ---
//! slam_section: "03-persistence-logging"
//! slam_subsection: "module"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Persistence abstractions and storage bindings."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_cbor::Value;
use sha2::{Digest, Sha256};

use crate::{PersistenceError, Result};

/// Leading bytes of every state blob.
pub const BLOB_MAGIC: &[u8; 8] = b"SLAMBLOB";

/// Current envelope version.
pub const BLOB_VERSION: u16 = 1;

/// Summary of a blob that was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    /// Envelope version written.
    pub version: u16,
    /// Timestamp recorded in the envelope.
    pub created_at: DateTime<Utc>,
    /// Hex SHA-256 of the encoded payload.
    pub hash: String,
    /// Total size of the blob including the magic marker.
    pub bytes: usize,
}

#[derive(Debug, Deserialize)]
struct EnvelopeHeader {
    version: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlobEnvelope {
    version: u16,
    created_at: DateTime<Utc>,
    hash: String,
    payload: Value,
}

/// Encode `payload` into `writer` as a versioned, hashed blob.
pub fn write_blob<W: Write, T: Serialize>(mut writer: W, payload: &T) -> Result<BlobInfo> {
    let payload = serde_cbor::value::to_value(payload)?;
    let envelope = BlobEnvelope {
        version: BLOB_VERSION,
        created_at: Utc::now(),
        hash: compute_hash(&payload)?,
        payload,
    };
    let body = serde_cbor::to_vec(&envelope)?;
    writer.write_all(BLOB_MAGIC)?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(BlobInfo {
        version: envelope.version,
        created_at: envelope.created_at,
        hash: envelope.hash,
        bytes: BLOB_MAGIC.len() + body.len(),
    })
}

/// Decode a blob produced by [`write_blob`], verifying version and hash.
pub fn read_blob<R: Read, T: DeserializeOwned>(mut reader: R) -> Result<T> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    let envelope = decode_envelope(&bytes)?;
    let expected = compute_hash(&envelope.payload)?;
    if envelope.hash != expected {
        return Err(PersistenceError::HashMismatch);
    }
    serde_cbor::value::from_value(envelope.payload).map_err(PersistenceError::from)
}

fn decode_envelope(bytes: &[u8]) -> Result<BlobEnvelope> {
    if bytes.len() < BLOB_MAGIC.len() {
        return if BLOB_MAGIC.starts_with(bytes) {
            Err(PersistenceError::Truncated)
        } else {
            Err(PersistenceError::BadMagic)
        };
    }
    let (magic, body) = bytes.split_at(BLOB_MAGIC.len());
    if magic != BLOB_MAGIC {
        return Err(PersistenceError::BadMagic);
    }
    let header: EnvelopeHeader = serde_cbor::from_slice(body).map_err(map_decode_error)?;
    if header.version != BLOB_VERSION {
        return Err(PersistenceError::VersionMismatch {
            found: header.version,
            expected: BLOB_VERSION,
        });
    }
    serde_cbor::from_slice(body).map_err(map_decode_error)
}

fn map_decode_error(err: serde_cbor::Error) -> PersistenceError {
    if err.is_eof() {
        PersistenceError::Truncated
    } else {
        PersistenceError::Cbor(err)
    }
}

fn compute_hash(payload: &Value) -> Result<String> {
    let serialized = serde_cbor::to_vec(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized);
    Ok(hex::encode(hasher.finalize()))
}
