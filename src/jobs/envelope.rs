// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Signed job envelopes.
//!
//! Every job is stored as `{"message": ..., "digest": "<hex>"}` where the digest is an
//! HMAC-SHA256 over the serialized message, keyed with the shared job secret. Consumers refuse
//! to act on a message whose digest does not match.

use {
    hmac::{Hmac, Mac},
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    serde_json::Value,
    sha2::Sha256,
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope is not valid JSON: {0}")]
    Malformed(serde_json::Error),

    #[error("envelope digest does not match its message")]
    Integrity,

    #[error("authentic message has an unexpected shape: {0}")]
    Decode(serde_json::Error),

    #[error("invalid job secret")]
    Key,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message: Value,
    pub digest: String,
}

fn mac(secret: &[u8], message: &Value) -> Result<HmacSha256, EnvelopeError> {
    let bytes = serde_json::to_vec(message).map_err(EnvelopeError::Malformed)?;
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| EnvelopeError::Key)?;
    mac.update(&bytes);
    Ok(mac)
}

impl Envelope {
    pub fn seal<T: Serialize>(secret: &[u8], message: &T) -> Result<Self, EnvelopeError> {
        let message = serde_json::to_value(message).map_err(EnvelopeError::Malformed)?;
        let digest = hex::encode(mac(secret, &message)?.finalize().into_bytes());
        Ok(Self { message, digest })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Malformed)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(EnvelopeError::Malformed)
    }

    /// Verify the digest, then decode the message.
    pub fn open<T: DeserializeOwned>(self, secret: &[u8]) -> Result<T, EnvelopeError> {
        let expected = hex::decode(&self.digest).map_err(|_| EnvelopeError::Integrity)?;
        mac(secret, &self.message)?
            .verify_slice(&expected)
            .map_err(|_| EnvelopeError::Integrity)?;
        serde_json::from_value(self.message).map_err(EnvelopeError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn open_sealed() {
        let envelope = Envelope::seal(b"s3cret", &json!({"type": "cancel"})).unwrap();
        let bytes = envelope.to_bytes().unwrap();
        let opened: Value = Envelope::from_bytes(&bytes)
            .unwrap()
            .open(b"s3cret")
            .unwrap();
        assert_eq!(opened, json!({"type": "cancel"}));
    }

    #[test]
    fn tampered_message_is_rejected() {
        let mut envelope =
            Envelope::seal(b"s3cret", &json!({"name": "web", "force": false})).unwrap();
        envelope.message["force"] = json!(true);
        assert!(matches!(
            envelope.open::<Value>(b"s3cret"),
            Err(EnvelopeError::Integrity)
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let envelope = Envelope::seal(b"s3cret", &json!({"name": "web"})).unwrap();
        assert!(matches!(
            envelope.clone().open::<Value>(b"other"),
            Err(EnvelopeError::Integrity)
        ));

        let garbled = Envelope {
            digest: "not hex".to_string(),
            ..envelope
        };
        assert!(matches!(
            garbled.open::<Value>(b"s3cret"),
            Err(EnvelopeError::Integrity)
        ));
    }
}
