//! C4 Envelope Codec: encode/decode the three versioned envelope formats as
//! JSON (spec §3 "Envelope", §4.4).

use crate::error::{DedpasteError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecipientType {
    #[serde(rename = "self")]
    SelfType,
    Friend,
    Pgp,
    Keybase,
    Github,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridRecipientMeta {
    #[serde(rename = "type")]
    pub kind: RecipientType,
    pub name: String,
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridMetadata {
    pub sender: String,
    pub recipient: HybridRecipientMeta,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgpRecipientMeta {
    #[serde(rename = "type")]
    pub kind: String, // always "pgp"
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "keyId")]
    pub key_id: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgpMetadata {
    pub sender: String,
    pub recipient: PgpRecipientMeta,
    pub pgp: bool,
    pub timestamp: DateTime<Utc>,
}

/// The three versioned envelope shapes (spec §3 "Envelope").
#[derive(Debug, Clone)]
pub enum Envelope {
    /// Legacy, decrypt-only: no metadata.
    V1 {
        encrypted_key: Vec<u8>,
        iv: Vec<u8>,
        auth_tag: Vec<u8>,
        encrypted_content: Vec<u8>,
    },
    V2 {
        metadata: HybridMetadata,
        encrypted_key: Vec<u8>,
        iv: Vec<u8>,
        auth_tag: Vec<u8>,
        encrypted_content: Vec<u8>,
    },
    V3 {
        metadata: PgpMetadata,
        pgp_encrypted: Vec<u8>,
    },
}

impl Envelope {
    pub fn version(&self) -> u32 {
        match self {
            Envelope::V1 { .. } => 1,
            Envelope::V2 { .. } => 2,
            Envelope::V3 { .. } => 3,
        }
    }
}

// Wire representation kept separate from the in-memory enum so field
// ordering on encode is explicit (spec §4.4 "canonical ordering") and
// decode can validate `version` before committing to a variant.
#[derive(Serialize, Deserialize)]
struct WireV1 {
    version: u32,
    #[serde(rename = "encryptedKey")]
    encrypted_key: String,
    iv: String,
    #[serde(rename = "authTag")]
    auth_tag: String,
    #[serde(rename = "encryptedContent")]
    encrypted_content: String,
}

#[derive(Serialize, Deserialize)]
struct WireV2 {
    version: u32,
    metadata: HybridMetadata,
    #[serde(rename = "encryptedKey")]
    encrypted_key: String,
    iv: String,
    #[serde(rename = "authTag")]
    auth_tag: String,
    #[serde(rename = "encryptedContent")]
    encrypted_content: String,
}

#[derive(Serialize, Deserialize)]
struct WireV3 {
    version: u32,
    metadata: PgpMetadata,
    #[serde(rename = "pgpEncrypted")]
    pgp_encrypted: String,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    let json = match envelope {
        Envelope::V1 { encrypted_key, iv, auth_tag, encrypted_content } => {
            serde_json::to_vec(&WireV1 {
                version: 1,
                encrypted_key: BASE64.encode(encrypted_key),
                iv: BASE64.encode(iv),
                auth_tag: BASE64.encode(auth_tag),
                encrypted_content: BASE64.encode(encrypted_content),
            })?
        }
        Envelope::V2 { metadata, encrypted_key, iv, auth_tag, encrypted_content } => {
            serde_json::to_vec(&WireV2 {
                version: 2,
                metadata: metadata.clone(),
                encrypted_key: BASE64.encode(encrypted_key),
                iv: BASE64.encode(iv),
                auth_tag: BASE64.encode(auth_tag),
                encrypted_content: BASE64.encode(encrypted_content),
            })?
        }
        Envelope::V3 { metadata, pgp_encrypted } => serde_json::to_vec(&WireV3 {
            version: 3,
            metadata: metadata.clone(),
            pgp_encrypted: BASE64.encode(pgp_encrypted),
        })?,
    };
    Ok(json)
}

pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| DedpasteError::StoreCorrupt("envelope is not valid UTF-8".to_string()))?;

    let probe: VersionProbe = serde_json::from_str(text)?;
    match probe.version {
        1 => {
            let wire: WireV1 = serde_json::from_str(text)?;
            Ok(Envelope::V1 {
                encrypted_key: BASE64.decode(wire.encrypted_key)?,
                iv: BASE64.decode(wire.iv)?,
                auth_tag: BASE64.decode(wire.auth_tag)?,
                encrypted_content: BASE64.decode(wire.encrypted_content)?,
            })
        }
        2 => {
            let wire: WireV2 = serde_json::from_str(text)?;
            Ok(Envelope::V2 {
                metadata: wire.metadata,
                encrypted_key: BASE64.decode(wire.encrypted_key)?,
                iv: BASE64.decode(wire.iv)?,
                auth_tag: BASE64.decode(wire.auth_tag)?,
                encrypted_content: BASE64.decode(wire.encrypted_content)?,
            })
        }
        3 => {
            let wire: WireV3 = serde_json::from_str(text)?;
            Ok(Envelope::V3 {
                metadata: wire.metadata,
                pgp_encrypted: BASE64.decode(wire.pgp_encrypted)?,
            })
        }
        other => Err(DedpasteError::UnsupportedVersion(other)),
    }
}
