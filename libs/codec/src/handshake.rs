//! Connection handshake payloads
//!
//! The connecting side sends a [`HandshakeRequest`] as the first frame; the
//! accepting side answers with a [`HandshakeResponse`]. Both are JSON so the
//! exchange stays readable in packet captures. Versions are compared on
//! `major.minor` only.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// `major.minor` of this protocol implementation
pub fn protocol_version() -> String {
    let mut parts = env!("CARGO_PKG_VERSION").split('.');
    let major = parts.next().unwrap_or("0");
    let minor = parts.next().unwrap_or("0");
    format!("{major}.{minor}")
}

/// First frame sent by the connecting side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

impl HandshakeRequest {
    pub fn new(auth: Option<String>) -> Self {
        Self {
            version: protocol_version(),
            auth,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::handshake(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| ProtocolError::handshake(e.to_string()))
    }

    /// Evaluate this request against the local version and expected secret
    pub fn evaluate(&self, expected_auth: Option<&str>) -> HandshakeResponse {
        let version = protocol_version();
        let rejection = if self.version != version {
            Some(format!(
                "version mismatch: peer {} local {}",
                self.version, version
            ))
        } else if expected_auth.is_some() && self.auth.as_deref() != expected_auth {
            Some("authentication failed".to_string())
        } else {
            None
        };

        HandshakeResponse {
            accepted: rejection.is_none(),
            version,
            reason: rejection,
        }
    }
}

/// Reply from the accepting side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub accepted: bool,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl HandshakeResponse {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::handshake(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| ProtocolError::handshake(e.to_string()))
    }

    /// Turn a rejection into an error
    pub fn into_result(self) -> Result<()> {
        if self.accepted {
            Ok(())
        } else {
            Err(ProtocolError::handshake(
                self.reason
                    .unwrap_or_else(|| "connection rejected by peer".to_string()),
            ))
        }
    }
}
