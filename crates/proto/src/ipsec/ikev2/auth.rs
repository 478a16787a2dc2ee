//! IKEv2 Authentication
//!
//! Implements the AUTH payload computation of RFC 7296 Section 2.15 behind
//! the [`Authenticator`] contract. The state machine only ever talks to the
//! trait; [`PskAuthenticator`] is the shared-key implementation.

use std::collections::HashMap;

use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::payload::{AuthMethod, AuthPayload, IdPayload, Identification};
use crate::ipsec::crypto::{KeyMaterial, PrfAlgorithm};
use crate::ipsec::{Error, Result};

/// Key pad for IKEv2 (RFC 7296 Section 2.15)
const KEY_PAD_IKEV2: &[u8] = b"Key Pad for IKEv2";

/// Computes and verifies AUTH payloads
pub trait Authenticator: Send + Sync {
    /// Compute our AUTH payload
    ///
    /// # Arguments
    ///
    /// * `keys` - IKE_SA key material (SK_pi / SK_pr)
    /// * `init_message` - The IKE_SA_INIT message we sent, first to last octet
    /// * `peer_nonce` - Nonce data received from the peer
    /// * `my_id` - Our ID payload
    /// * `is_initiator` - Whether we are the original initiator
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthenticationFailed`] if no credential is available
    fn compute_auth_data(
        &self,
        keys: &KeyMaterial,
        init_message: &[u8],
        peer_nonce: &[u8],
        my_id: &IdPayload,
        is_initiator: bool,
    ) -> Result<AuthPayload>;

    /// Verify the peer's AUTH payload
    ///
    /// # Arguments
    ///
    /// * `keys` - IKE_SA key material
    /// * `init_message` - The IKE_SA_INIT message the peer sent
    /// * `my_nonce` - Nonce data we sent
    /// * `other_id` - The peer's ID payload
    /// * `other_is_initiator` - Whether the peer is the original initiator
    /// * `auth` - AUTH payload received
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthenticationFailed`] if the AUTH data does not match
    fn verify_auth_data(
        &self,
        keys: &KeyMaterial,
        init_message: &[u8],
        my_nonce: &[u8],
        other_id: &IdPayload,
        other_is_initiator: bool,
        auth: &AuthPayload,
    ) -> Result<()>;
}

/// Construct signed octets (RFC 7296 Section 2.15)
///
/// ```text
/// InitiatorSignedOctets = RealMessage1 | NonceRData | prf(SK_pi, IDi')
/// ResponderSignedOctets = RealMessage2 | NonceIData | prf(SK_pr, IDr')
/// ```
pub fn signed_octets(
    keys: &KeyMaterial,
    init_message: &[u8],
    nonce: &[u8],
    id: &IdPayload,
    signer_is_initiator: bool,
) -> Vec<u8> {
    let sk_p = if signer_is_initiator {
        &keys.sk_pi
    } else {
        &keys.sk_pr
    };

    let mut octets = Vec::with_capacity(init_message.len() + nonce.len() + keys.prf.output_len());
    octets.extend_from_slice(init_message);
    octets.extend_from_slice(nonce);
    octets.extend_from_slice(&keys.prf.compute(sk_p, &id.to_payload_data()));
    octets
}

/// Shared-key MIC (RFC 7296 Section 2.15)
///
/// ```text
/// AUTH = prf(prf(Shared Secret, "Key Pad for IKEv2"), <SignedOctets>)
/// ```
pub fn compute_psk_auth(prf: PrfAlgorithm, secret: &[u8], octets: &[u8]) -> AuthPayload {
    let padded = Zeroizing::new(prf.compute(secret, KEY_PAD_IKEV2));
    AuthPayload::new(AuthMethod::SharedKeyMic, prf.compute(&padded, octets))
}

/// Pre-shared key authenticator
///
/// Secrets are looked up by identity, falling back to a default secret.
pub struct PskAuthenticator {
    default_secret: Option<Zeroizing<Vec<u8>>>,
    secrets: HashMap<Identification, Zeroizing<Vec<u8>>>,
}

impl PskAuthenticator {
    /// Authenticator using one secret for every identity
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        PskAuthenticator {
            default_secret: Some(Zeroizing::new(secret.into())),
            secrets: HashMap::new(),
        }
    }

    /// Authenticator without a default secret
    pub fn empty() -> Self {
        PskAuthenticator {
            default_secret: None,
            secrets: HashMap::new(),
        }
    }

    /// Register a secret for a specific identity
    pub fn with_secret(mut self, identity: Identification, secret: impl Into<Vec<u8>>) -> Self {
        self.secrets.insert(identity, Zeroizing::new(secret.into()));
        self
    }

    fn secret_for(&self, identity: &Identification) -> Result<&[u8]> {
        self.secrets
            .get(identity)
            .or(self.default_secret.as_ref())
            .map(|s| s.as_slice())
            .ok_or_else(|| {
                Error::AuthenticationFailed(format!("no shared key for '{}'", identity))
            })
    }
}

impl Authenticator for PskAuthenticator {
    fn compute_auth_data(
        &self,
        keys: &KeyMaterial,
        init_message: &[u8],
        peer_nonce: &[u8],
        my_id: &IdPayload,
        is_initiator: bool,
    ) -> Result<AuthPayload> {
        let secret = self.secret_for(&my_id.identity)?;
        let octets = signed_octets(keys, init_message, peer_nonce, my_id, is_initiator);
        Ok(compute_psk_auth(keys.prf, secret, &octets))
    }

    fn verify_auth_data(
        &self,
        keys: &KeyMaterial,
        init_message: &[u8],
        my_nonce: &[u8],
        other_id: &IdPayload,
        other_is_initiator: bool,
        auth: &AuthPayload,
    ) -> Result<()> {
        if auth.auth_method != AuthMethod::SharedKeyMic {
            return Err(Error::AuthenticationFailed(format!(
                "Expected PSK auth, got {:?}",
                auth.auth_method
            )));
        }

        let secret = self.secret_for(&other_id.identity)?;
        let octets = signed_octets(keys, init_message, my_nonce, other_id, other_is_initiator);
        let expected = compute_psk_auth(keys.prf, secret, &octets);

        if expected.auth_data.ct_eq(&auth.auth_data).into() {
            Ok(())
        } else {
            Err(Error::AuthenticationFailed(format!(
                "AUTH verification failed for '{}'",
                other_id.identity
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::crypto::KeySizes;
    use std::sync::Arc;

    fn create_test_keys() -> KeyMaterial {
        KeyMaterial::derive(
            KeySizes {
                prf: PrfAlgorithm::HmacSha256,
                encr_key_len: 20,
                integ_key_len: 0,
            },
            &[1; 32],
            &[2; 32],
            &[3; 64],
            10,
            20,
        )
        .unwrap()
    }

    fn create_test_id(name: &str) -> IdPayload {
        IdPayload::new(Arc::new(Identification::fqdn(name)))
    }

    #[test]
    fn test_psk_auth_deterministic() {
        let a = compute_psk_auth(PrfAlgorithm::HmacSha256, b"secret", b"octets");
        let b = compute_psk_auth(PrfAlgorithm::HmacSha256, b"secret", b"octets");
        let c = compute_psk_auth(PrfAlgorithm::HmacSha256, b"other", b"octets");

        assert_eq!(a.auth_method, AuthMethod::SharedKeyMic);
        assert_eq!(a.auth_data.len(), 32);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_signed_octets_layout() {
        let keys = create_test_keys();
        let id = create_test_id("alice.example.com");
        let octets = signed_octets(&keys, b"MSG1", b"NONCE", &id, true);

        assert!(octets.starts_with(b"MSG1NONCE"));
        assert_eq!(octets.len(), 4 + 5 + 32);
        assert_ne!(octets, signed_octets(&keys, b"MSG1", b"NONCE", &id, false));
    }

    #[test]
    fn test_initiator_auth_verified_by_responder() {
        let keys = create_test_keys();
        let alice = create_test_id("alice.example.com");
        let psk = PskAuthenticator::new("s3cr3t");

        let auth = psk
            .compute_auth_data(&keys, b"IKE_SA_INIT request", b"nonce_r", &alice, true)
            .unwrap();
        psk.verify_auth_data(&keys, b"IKE_SA_INIT request", b"nonce_r", &alice, true, &auth)
            .unwrap();
    }

    #[test]
    fn test_verify_wrong_message_fails() {
        let keys = create_test_keys();
        let alice = create_test_id("alice.example.com");
        let psk = PskAuthenticator::new("s3cr3t");

        let auth = psk
            .compute_auth_data(&keys, b"request", b"nonce_r", &alice, true)
            .unwrap();
        let result = psk.verify_auth_data(&keys, b"tampered", b"nonce_r", &alice, true, &auth);
        assert!(matches!(result, Err(Error::AuthenticationFailed(_))));

        let result = psk.verify_auth_data(&keys, b"request", b"nonce_r", &alice, false, &auth);
        assert!(result.is_err());
    }

    #[test]
    fn test_verify_wrong_method_fails() {
        let keys = create_test_keys();
        let alice = create_test_id("alice.example.com");
        let psk = PskAuthenticator::new("s3cr3t");

        let auth = AuthPayload::new(AuthMethod::RsaSig, vec![0; 32]);
        let result = psk.verify_auth_data(&keys, b"request", b"nonce", &alice, true, &auth);
        assert!(matches!(result, Err(Error::AuthenticationFailed(_))));
    }

    #[test]
    fn test_per_identity_secret() {
        let keys = create_test_keys();
        let alice = create_test_id("alice.example.com");
        let bob = create_test_id("bob.example.com");

        let psk = PskAuthenticator::empty()
            .with_secret(Identification::fqdn("alice.example.com"), "alice-key");

        assert!(psk
            .compute_auth_data(&keys, b"m", b"n", &alice, true)
            .is_ok());
        assert!(matches!(
            psk.compute_auth_data(&keys, b"m", b"n", &bob, true),
            Err(Error::AuthenticationFailed(_))
        ));
    }
}
