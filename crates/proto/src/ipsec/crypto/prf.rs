//! Pseudo-Random Function (PRF) implementations
//!
//! Implements PRF algorithms and IKE_SA key derivation as defined in
//! RFC 7296 Sections 2.13, 2.14 and 2.18.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::ipsec::ikev2::proposal::{
    EncrTransformId, IntegTransformId, PrfTransformId, Proposal, TransformType,
};
use crate::ipsec::{Error, Result};

/// PRF algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrfAlgorithm {
    /// HMAC-SHA2-256
    HmacSha256,
    /// HMAC-SHA2-384
    HmacSha384,
    /// HMAC-SHA2-512
    HmacSha512,
}

impl PrfAlgorithm {
    /// Map a negotiated PRF transform to an algorithm
    pub fn from_transform_id(id: PrfTransformId) -> Self {
        match id {
            PrfTransformId::HmacSha256 => PrfAlgorithm::HmacSha256,
            PrfTransformId::HmacSha384 => PrfAlgorithm::HmacSha384,
            PrfTransformId::HmacSha512 => PrfAlgorithm::HmacSha512,
        }
    }

    /// Get PRF output length in bytes
    pub fn output_len(self) -> usize {
        match self {
            PrfAlgorithm::HmacSha256 => 32,
            PrfAlgorithm::HmacSha384 => 48,
            PrfAlgorithm::HmacSha512 => 64,
        }
    }

    /// Compute prf(key, data)
    pub fn compute(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            PrfAlgorithm::HmacSha256 => {
                let mut mac =
                    Hmac::<Sha256>::new_from_slice(key).expect("HMAC can take key of any size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            PrfAlgorithm::HmacSha384 => {
                let mut mac =
                    Hmac::<Sha384>::new_from_slice(key).expect("HMAC can take key of any size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            PrfAlgorithm::HmacSha512 => {
                let mut mac =
                    Hmac::<Sha512>::new_from_slice(key).expect("HMAC can take key of any size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Compute prf+ (key expansion function)
    ///
    /// ```text
    /// prf+ (K,S) = T1 | T2 | T3 | T4 | ...
    ///
    /// T1 = prf (K, S | 0x01)
    /// T2 = prf (K, T1 | S | 0x02)
    /// ...
    /// ```
    ///
    /// The one-byte counter limits the output to 255 blocks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyDerivation`] if more output is requested than
    /// prf+ can produce.
    pub fn prf_plus(self, key: &[u8], seed: &[u8], output_len: usize) -> Result<Zeroizing<Vec<u8>>> {
        if output_len > 255 * self.output_len() {
            return Err(Error::KeyDerivation(format!(
                "prf+ cannot produce {} bytes",
                output_len
            )));
        }

        let mut output = Zeroizing::new(Vec::with_capacity(output_len));
        let mut t = Zeroizing::new(Vec::new());
        let mut counter: u8 = 1;

        while output.len() < output_len {
            let mut input = Zeroizing::new(Vec::with_capacity(t.len() + seed.len() + 1));
            input.extend_from_slice(&t);
            input.extend_from_slice(seed);
            input.push(counter);

            t = Zeroizing::new(self.compute(key, &input));
            output.extend_from_slice(&t);

            counter = counter.wrapping_add(1);
        }

        output.truncate(output_len);
        Ok(output)
    }
}

/// Algorithm choices and key lengths taken from a selected IKE proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySizes {
    /// Negotiated PRF
    pub prf: PrfAlgorithm,
    /// Encryption key length in bytes, salt included for AEAD
    pub encr_key_len: usize,
    /// Integrity key length in bytes (0 for AEAD ciphers)
    pub integ_key_len: usize,
}

impl KeySizes {
    /// Read algorithms and key lengths from a selected proposal
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyDerivation`] if a mandatory transform is missing or
    /// names an algorithm this core cannot key.
    pub fn from_proposal(proposal: &Proposal) -> Result<Self> {
        let prf = proposal
            .get_transform(TransformType::Prf)
            .ok_or_else(|| Error::KeyDerivation("proposal has no PRF".into()))?;
        let prf = PrfTransformId::from_u16(prf.transform_id)
            .map(PrfAlgorithm::from_transform_id)
            .ok_or_else(|| {
                Error::KeyDerivation(format!("unsupported PRF {}", prf.transform_id))
            })?;

        let encr = proposal
            .get_transform(TransformType::Encr)
            .ok_or_else(|| Error::KeyDerivation("proposal has no encryption algorithm".into()))?;
        let encr_id = EncrTransformId::from_u16(encr.transform_id).ok_or_else(|| {
            Error::KeyDerivation(format!("unsupported encryption {}", encr.transform_id))
        })?;

        let integ_key_len = match proposal.get_transform(TransformType::Integ) {
            Some(integ) => IntegTransformId::from_u16(integ.transform_id)
                .map(IntegTransformId::key_len)
                .ok_or_else(|| {
                    Error::KeyDerivation(format!("unsupported integrity {}", integ.transform_id))
                })?,
            None if encr_id.is_aead() => 0,
            None => {
                return Err(Error::KeyDerivation(
                    "non-AEAD proposal without integrity algorithm".into(),
                ))
            }
        };

        Ok(KeySizes {
            prf,
            encr_key_len: encr_id.keymat_len(encr.key_length),
            integ_key_len,
        })
    }
}

/// IKEv2 key material
///
/// Owned by exactly one IKE_SA and wiped when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    /// PRF negotiated for this IKE_SA
    #[zeroize(skip)]
    pub prf: PrfAlgorithm,

    /// SK_d - Key for deriving Child SA keys
    pub sk_d: Vec<u8>,

    /// SK_ai - Initiator's integrity key
    pub sk_ai: Vec<u8>,

    /// SK_ar - Responder's integrity key
    pub sk_ar: Vec<u8>,

    /// SK_ei - Initiator's encryption key
    pub sk_ei: Vec<u8>,

    /// SK_er - Responder's encryption key
    pub sk_er: Vec<u8>,

    /// SK_pi - Initiator's AUTH payload key
    pub sk_pi: Vec<u8>,

    /// SK_pr - Responder's AUTH payload key
    pub sk_pr: Vec<u8>,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("prf", &self.prf)
            .field("sk_d", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl KeyMaterial {
    /// Derive initial IKE_SA keys (RFC 7296 Section 2.14)
    ///
    /// ```text
    /// SKEYSEED = prf(Ni | Nr, g^ir)
    ///
    /// {SK_d | SK_ai | SK_ar | SK_ei | SK_er | SK_pi | SK_pr}
    ///     = prf+ (SKEYSEED, Ni | Nr | SPIi | SPIr)
    /// ```
    pub fn derive(
        sizes: KeySizes,
        nonce_i: &[u8],
        nonce_r: &[u8],
        shared_secret: &[u8],
        spi_i: u64,
        spi_r: u64,
    ) -> Result<Self> {
        let mut prf_key = Zeroizing::new(Vec::with_capacity(nonce_i.len() + nonce_r.len()));
        prf_key.extend_from_slice(nonce_i);
        prf_key.extend_from_slice(nonce_r);

        let skeyseed = Zeroizing::new(sizes.prf.compute(&prf_key, shared_secret));
        Self::expand(sizes, &skeyseed, nonce_i, nonce_r, spi_i, spi_r)
    }

    /// Derive keys for a rekeyed IKE_SA (RFC 7296 Section 2.18)
    ///
    /// ```text
    /// SKEYSEED = prf(SK_d (old), g^ir (new) | Ni | Nr)
    /// ```
    ///
    /// The old SA's PRF keys SKEYSEED; `sizes` describes the new SA.
    #[allow(clippy::too_many_arguments)]
    pub fn derive_rekey(
        old: &KeyMaterial,
        sizes: KeySizes,
        nonce_i: &[u8],
        nonce_r: &[u8],
        shared_secret: &[u8],
        spi_i: u64,
        spi_r: u64,
    ) -> Result<Self> {
        let mut input = Zeroizing::new(Vec::with_capacity(
            shared_secret.len() + nonce_i.len() + nonce_r.len(),
        ));
        input.extend_from_slice(shared_secret);
        input.extend_from_slice(nonce_i);
        input.extend_from_slice(nonce_r);

        let skeyseed = Zeroizing::new(old.prf.compute(&old.sk_d, &input));
        Self::expand(sizes, &skeyseed, nonce_i, nonce_r, spi_i, spi_r)
    }

    fn expand(
        sizes: KeySizes,
        skeyseed: &[u8],
        nonce_i: &[u8],
        nonce_r: &[u8],
        spi_i: u64,
        spi_r: u64,
    ) -> Result<Self> {
        let mut seed = Vec::with_capacity(nonce_i.len() + nonce_r.len() + 16);
        seed.extend_from_slice(nonce_i);
        seed.extend_from_slice(nonce_r);
        seed.extend_from_slice(&spi_i.to_be_bytes());
        seed.extend_from_slice(&spi_r.to_be_bytes());

        let prf_len = sizes.prf.output_len();
        let integ_len = sizes.integ_key_len;
        let encr_len = sizes.encr_key_len;
        let total_len = 3 * prf_len + 2 * integ_len + 2 * encr_len;
        let keymat = sizes.prf.prf_plus(skeyseed, &seed, total_len)?;

        let mut offset = 0;
        let mut take = |len: usize| {
            let key = keymat[offset..offset + len].to_vec();
            offset += len;
            key
        };

        Ok(KeyMaterial {
            prf: sizes.prf,
            sk_d: take(prf_len),
            sk_ai: take(integ_len),
            sk_ar: take(integ_len),
            sk_ei: take(encr_len),
            sk_er: take(encr_len),
            sk_pi: take(prf_len),
            sk_pr: take(prf_len),
        })
    }

    /// Child SA keying material (RFC 7296 Section 2.17)
    ///
    /// ```text
    /// KEYMAT = prf+(SK_d, Ni | Nr)
    /// ```
    pub fn child_keymat(&self, nonce_i: &[u8], nonce_r: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>> {
        let mut seed = Vec::with_capacity(nonce_i.len() + nonce_r.len());
        seed.extend_from_slice(nonce_i);
        seed.extend_from_slice(nonce_r);
        self.prf.prf_plus(&self.sk_d, &seed, len)
    }
}
