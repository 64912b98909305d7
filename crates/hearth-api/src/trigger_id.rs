use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

use hearth_types::{new_id, now_millis};

use crate::error::AppError;

/// How long a trigger id stays valid after it was minted.
pub const TRIGGER_ID_TIMEOUT_MS: i64 = 3_000;

/// Mints and verifies interactive trigger ids. A trigger id is the base64
/// of `client_trigger_id:user_id:millis:signature`.
pub struct TriggerIdSigner {
    signing: SigningKey,
}

impl TriggerIdSigner {
    pub fn generate() -> Self {
        let seed: [u8; 32] = rand::random();
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Returns `(client_trigger_id, trigger_id)`.
    pub fn generate_trigger_id(&self, user_id: &str) -> (String, String) {
        self.generate_at(user_id, now_millis())
    }

    fn generate_at(&self, user_id: &str, millis: i64) -> (String, String) {
        let client_trigger_id = new_id();
        let data = format!("{}:{}:{}", client_trigger_id, user_id, millis);
        let signature = self.signing.sign(data.as_bytes());
        let raw = format!("{}:{}", data, B64.encode(signature.to_bytes()));
        (client_trigger_id, B64.encode(raw))
    }

    /// Returns `(client_trigger_id, user_id)` of a fresh, correctly signed id.
    pub fn decode_and_verify(&self, trigger_id: &str) -> Result<(String, String), AppError> {
        const LOC: &str = "decode_and_verify_trigger_id";
        let invalid = |detail: &str| AppError::bad_request(LOC, "interactive_message.decode_trigger_id.base64_decode_failed", detail.to_string());

        let raw = B64.decode(trigger_id).map_err(|e| invalid(&e.to_string()))?;
        let raw = String::from_utf8(raw).map_err(|e| invalid(&e.to_string()))?;
        let parts: Vec<&str> = raw.splitn(4, ':').collect();
        let [client_trigger_id, user_id, millis, signature] = parts[..] else {
            return Err(AppError::bad_request(LOC, "interactive_message.decode_trigger_id.missing_data", ""));
        };

        let millis: i64 = millis.parse().map_err(|_| {
            AppError::bad_request(LOC, "interactive_message.decode_trigger_id.missing_data", "bad timestamp")
        })?;
        if millis + TRIGGER_ID_TIMEOUT_MS < now_millis() {
            return Err(AppError::bad_request(LOC, "interactive_message.decode_trigger_id.expired", ""));
        }

        let signature = B64.decode(signature).map_err(|e| invalid(&e.to_string()))?;
        let signature = Signature::from_slice(&signature).map_err(|_| {
            AppError::bad_request(LOC, "interactive_message.decode_trigger_id.signature_decode_failed", "")
        })?;
        let data = format!("{}:{}:{}", client_trigger_id, user_id, millis);
        self.verifying_key()
            .verify_strict(data.as_bytes(), &signature)
            .map_err(|_| AppError::bad_request(LOC, "interactive_message.decode_trigger_id.verify_signature_failed", ""))?;

        Ok((client_trigger_id.to_string(), user_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let signer = TriggerIdSigner::generate();
        let (client, trigger) = signer.generate_trigger_id("user1");
        let (decoded_client, user) = signer.decode_and_verify(&trigger).unwrap();
        assert_eq!(decoded_client, client);
        assert_eq!(user, "user1");
    }

    #[test]
    fn expired_ids_are_rejected() {
        let signer = TriggerIdSigner::generate();
        let (_, trigger) = signer.generate_at("user1", now_millis() - 10_000);
        let err = signer.decode_and_verify(&trigger).unwrap_err();
        assert_eq!(err.id, "interactive_message.decode_trigger_id.expired");
    }

    #[test]
    fn other_keys_do_not_verify() {
        let signer = TriggerIdSigner::generate();
        let other = TriggerIdSigner::generate();
        let (_, trigger) = signer.generate_trigger_id("user1");
        let err = other.decode_and_verify(&trigger).unwrap_err();
        assert_eq!(err.id, "interactive_message.decode_trigger_id.verify_signature_failed");
    }

    #[test]
    fn garbage_is_rejected() {
        let signer = TriggerIdSigner::generate();
        assert!(signer.decode_and_verify("%%%").is_err());
        assert!(signer.decode_and_verify(&B64.encode("a:b")).is_err());
    }
}
