//! Webhook Signature Verification
//!
//! Incoming webhooks carry `Authorization: <hex>` where the value is
//! HMAC-SHA256 over the raw request body. The platform rotates between the
//! partner key and a webhook-specific key, so both are tried. Keys prefixed
//! with the literal `shpk` have that prefix stripped before use.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::error::ProcessError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct SignatureVerifier {
    keys: Vec<(&'static str, String)>,
    debug_bypass: bool,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("keys", &self.keys.iter().map(|(l, _)| *l).collect::<Vec<_>>())
            .field("debug_bypass", &self.debug_bypass)
            .finish()
    }
}

fn strip_key_prefix(key: &str) -> &str {
    key.strip_prefix("shpk").unwrap_or(key)
}

impl SignatureVerifier {
    pub fn new(partner_key: Option<&str>, webhook_partner_key: Option<&str>) -> Self {
        let mut keys = Vec::new();
        if let Some(k) = partner_key.filter(|k| !k.is_empty()) {
            keys.push(("partner_key", strip_key_prefix(k).to_string()));
        }
        if let Some(k) = webhook_partner_key.filter(|k| !k.is_empty()) {
            keys.push(("webhook_partner_key", strip_key_prefix(k).to_string()));
        }

        // DEBUG_WEBHOOK=1 accepts invalid signatures for local testing.
        // Production deployments must not set it.
        let debug_bypass = std::env::var("DEBUG_WEBHOOK").map(|v| v == "1").unwrap_or(false);
        if debug_bypass {
            warn!("DEBUG_WEBHOOK=1 set: invalid webhook signatures will be accepted");
        }

        Self { keys, debug_bypass }
    }

    /// Returns true iff the header equals the hex HMAC-SHA256 of the body
    /// under one of the configured keys. Comparison is constant-time.
    pub fn verify(&self, raw_body: &[u8], signature_header: Option<&str>) -> bool {
        let Some(header) = signature_header.filter(|h| !h.is_empty()) else {
            warn!("Webhook received without Authorization header");
            return false;
        };

        if raw_body.is_empty() {
            warn!("Missing request body for signature verification");
            return false;
        }

        let Ok(provided) = hex::decode(header.trim()) else {
            warn!("Authorization header is not valid hex");
            return self.debug_bypass;
        };

        for (key_source, key) in &self.keys {
            let mut mac = match HmacSha256::new_from_slice(key.as_bytes()) {
                Ok(mac) => mac,
                Err(_) => continue,
            };
            mac.update(raw_body);

            // verify_slice is constant-time
            if mac.verify_slice(&provided).is_ok() {
                debug!(key_source, "Valid webhook signature");
                return true;
            }
        }

        let prefix: String = header.chars().take(16).collect();
        warn!("Invalid webhook signature. Got: {prefix}...");
        self.debug_bypass
    }

    /// Full request validation: UTF-8 body, non-blank body, then signature.
    pub fn validate_request(
        &self,
        raw_body: &[u8],
        signature_header: Option<&str>,
    ) -> Result<(), ProcessError> {
        let body_str = std::str::from_utf8(raw_body)
            .map_err(|e| ProcessError::validation(format!("invalid UTF-8 in request body: {e}")))?;

        if body_str.trim().is_empty() {
            return Err(ProcessError::validation("empty request body"));
        }

        if !self.verify(raw_body, signature_header) {
            return Err(ProcessError::validation("invalid webhook signature"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(key: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn verifier(partner_key: &str) -> SignatureVerifier {
        std::env::remove_var("DEBUG_WEBHOOK");
        SignatureVerifier::new(Some(partner_key), None)
    }

    #[test]
    fn accepts_valid_signature() {
        let body = br#"{"code":3,"data":{"ordersn":"A1"}}"#;
        let v = verifier("secret-key");
        let sig = sign("secret-key", body);
        assert!(v.verify(body, Some(&sig)));
    }

    #[test]
    fn strips_shpk_prefix_before_use() {
        let body = b"payload";
        let v = verifier("shpksecret-key");
        let sig = sign("secret-key", body);
        assert!(v.verify(body, Some(&sig)));
    }

    #[test]
    fn tries_webhook_key_after_partner_key() {
        let body = b"payload";
        std::env::remove_var("DEBUG_WEBHOOK");
        let v = SignatureVerifier::new(Some("primary"), Some("secondary"));
        let sig = sign("secondary", body);
        assert!(v.verify(body, Some(&sig)));
    }

    #[test]
    fn single_bit_flip_in_body_fails() {
        let body = b"payload".to_vec();
        let v = verifier("secret-key");
        let sig = sign("secret-key", &body);

        let mut mutated = body.clone();
        mutated[0] ^= 0x01;
        assert!(!v.verify(&mutated, Some(&sig)));
    }

    #[test]
    fn single_bit_flip_in_signature_fails() {
        let body = b"payload";
        let v = verifier("secret-key");
        let sig = sign("secret-key", body);

        let mut bytes = hex::decode(&sig).unwrap();
        bytes[0] ^= 0x01;
        let mutated = hex::encode(bytes);
        assert!(!v.verify(body, Some(&mutated)));
    }

    #[test]
    fn rejects_missing_header_and_empty_body() {
        let v = verifier("secret-key");
        assert!(!v.verify(b"payload", None));
        assert!(!v.verify(b"payload", Some("")));
        assert!(!v.verify(b"", Some("deadbeef")));
    }

    #[test]
    fn validate_request_classifies_failures() {
        let v = verifier("secret-key");

        let err = v.validate_request(b"   ", Some("deadbeef")).unwrap_err();
        assert!(err.to_string().contains("empty request body"));

        let err = v.validate_request(b"payload", Some("deadbeef")).unwrap_err();
        assert!(err.to_string().contains("invalid webhook signature"));

        let sig = sign("secret-key", b"payload");
        assert!(v.validate_request(b"payload", Some(&sig)).is_ok());
    }
}
