//! Signed live-connection tokens.
//!
//! A token binds a user id to an expiry:
//!
//! ```text
//! base64url(user_id|expires_unix_secs|base64url(hmac_sha256(key, "user_id|expires")))
//! ```
//!
//! where `key = sha256("civic-ws-token-v1:" ++ secret)`. Whatever verifies
//! credentials in front of the core mints tokens with the shared secret and
//! hands them to clients, which connect with `GET /ws?token=<token>`. The
//! socket never accepts a bare user id.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

const KEY_DOMAIN: &[u8] = b"civic-ws-token-v1:";

/// Why a token was refused. All variants map to `401` at the socket.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature does not match")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

/// Mints and checks connection tokens under one secret.
#[derive(Clone)]
pub struct WsTokenSigner {
    mac: Hmac<Sha256>,
    ttl_secs: u64,
}

impl WsTokenSigner {
    pub fn new(secret: &[u8], ttl_secs: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_DOMAIN);
        hasher.update(secret);
        let key = hasher.finalize();
        Self {
            mac: Hmac::<Sha256>::new_from_slice(&key).expect("HMAC key length is valid"),
            ttl_secs,
        }
    }

    /// A signer with a random secret. Only this process can mint tokens it
    /// accepts.
    pub fn ephemeral(ttl_secs: u64) -> Self {
        Self::new(&rand::random::<[u8; 32]>(), ttl_secs)
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Mints a token for `user_id` valid for the configured TTL from now.
    pub fn issue(&self, user_id: &str) -> String {
        self.issue_at(user_id, unix_now())
    }

    /// Mints a token as if issued at `issued_at` (unix seconds).
    pub fn issue_at(&self, user_id: &str, issued_at: u64) -> String {
        let payload = format!("{}|{}", user_id, issued_at.saturating_add(self.ttl_secs));
        let signature = URL_SAFE_NO_PAD.encode(self.sign(&payload));
        URL_SAFE_NO_PAD.encode(format!("{payload}|{signature}"))
    }

    /// Returns the user id bound to `token`.
    ///
    /// # Errors
    ///
    /// `Malformed` for anything that does not decode into the three fields,
    /// `BadSignature` when the fields were not signed with this secret, and
    /// `Expired` once the expiry has passed.
    pub fn verify(&self, token: &str) -> Result<String, TokenError> {
        self.verify_at(token, unix_now())
    }

    fn verify_at(&self, token: &str, now: u64) -> Result<String, TokenError> {
        let decoded = URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .map_err(|_| TokenError::Malformed)?;
        let text = String::from_utf8(decoded).map_err(|_| TokenError::Malformed)?;

        // Split from the right: user ids may contain the separator.
        let mut parts = text.rsplitn(3, '|');
        let (Some(signature), Some(expires), Some(user_id)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };
        if user_id.is_empty() {
            return Err(TokenError::Malformed);
        }
        let signature = URL_SAFE_NO_PAD
            .decode(signature.as_bytes())
            .map_err(|_| TokenError::Malformed)?;

        let mut mac = self.mac.clone();
        mac.update(format!("{user_id}|{expires}").as_bytes());
        mac.verify_slice(&signature).map_err(|_| TokenError::BadSignature)?;

        let expires: u64 = expires.parse().map_err(|_| TokenError::Malformed)?;
        if now > expires {
            return Err(TokenError::Expired);
        }
        Ok(user_id.to_string())
    }

    fn sign(&self, payload: &str) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    #[test]
    fn token_resolves_to_its_user_until_expiry() {
        let signer = WsTokenSigner::new(b"shared-secret", 60);
        let token = signer.issue_at("staff-1", NOW);

        assert_eq!(signer.verify_at(&token, NOW).as_deref(), Ok("staff-1"));
        assert_eq!(signer.verify_at(&token, NOW + 60).as_deref(), Ok("staff-1"));
        assert_eq!(signer.verify_at(&token, NOW + 61), Err(TokenError::Expired));
    }

    #[test]
    fn other_secrets_are_refused() {
        let token = WsTokenSigner::new(b"shared-secret", 60).issue_at("staff-1", NOW);
        let other = WsTokenSigner::new(b"another-secret", 60);
        assert_eq!(other.verify_at(&token, NOW), Err(TokenError::BadSignature));

        let random = WsTokenSigner::ephemeral(60);
        assert_eq!(random.verify_at(&token, NOW), Err(TokenError::BadSignature));
    }

    #[test]
    fn rebinding_to_another_user_breaks_the_signature() {
        let signer = WsTokenSigner::new(b"shared-secret", 60);
        let token = signer.issue_at("resident-a", NOW);
        let decoded = String::from_utf8(URL_SAFE_NO_PAD.decode(&token).expect("decodes"))
            .expect("utf-8");
        let forged = URL_SAFE_NO_PAD.encode(decoded.replacen("resident-a", "admin-1", 1));

        assert_eq!(signer.verify_at(&forged, NOW), Err(TokenError::BadSignature));
    }

    #[test]
    fn extending_the_expiry_breaks_the_signature() {
        let signer = WsTokenSigner::new(b"shared-secret", 60);
        let token = signer.issue_at("resident-a", NOW);
        let decoded = String::from_utf8(URL_SAFE_NO_PAD.decode(&token).expect("decodes"))
            .expect("utf-8");
        let forged = URL_SAFE_NO_PAD.encode(decoded.replacen(
            &(NOW + 60).to_string(),
            &(NOW + 6_000).to_string(),
            1,
        ));

        assert_eq!(signer.verify_at(&forged, NOW), Err(TokenError::BadSignature));
    }

    #[test]
    fn bare_ids_and_garbage_are_malformed() {
        let signer = WsTokenSigner::new(b"shared-secret", 60);
        let two_fields = URL_SAFE_NO_PAD.encode("a|b");
        for token in ["resident-a", "", "!!!", two_fields.as_str()] {
            assert_eq!(
                signer.verify_at(token, NOW),
                Err(TokenError::Malformed),
                "{token:?}"
            );
        }
    }

    #[test]
    fn separator_inside_user_id_survives() {
        let signer = WsTokenSigner::new(b"shared-secret", 60);
        let token = signer.issue_at("dept|roads", NOW);
        assert_eq!(signer.verify_at(&token, NOW).as_deref(), Ok("dept|roads"));
    }
}
