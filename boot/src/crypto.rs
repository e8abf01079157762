//! Signature checking.
//!
//! Digests are always SHA256.  Signatures go through `SignatureVerifier` so the
//! engine does not depend on a particular algorithm.  The P-256 key store is the
//! one provided here.

use sha2::{Digest, Sha256};

use crate::image::TlvKind;

/// The result of a SHA256 hash, appropriate for stack allocation.
pub type Hash256 = [u8; 32];

/// A set of trusted public keys, and the algorithm to check signatures with
/// them.
pub trait SignatureVerifier {
    /// The TLV kind that holds this verifier's signatures.
    fn signature_kind(&self) -> TlvKind;

    /// Return the index of the key whose hash starts with `keyhash`.
    fn find_key(&self, keyhash: &[u8]) -> Option<usize>;

    /// Check `signature` over the image `hash` with key number `key`.
    fn verify(&self, key: usize, hash: &Hash256, signature: &[u8]) -> bool;
}

/// The hash of a public key, as carried in the KEYHASH TLV.
pub fn key_hash(key: &[u8]) -> Hash256 {
    let mut result = [0u8; 32];
    result.copy_from_slice(&Sha256::digest(key));
    result
}

#[cfg(feature = "p256")]
mod ecdsa {
    use p256::ecdsa::{signature::hazmat::PrehashVerifier, Signature, VerifyingKey};
    use p256::EncodedPoint;

    use super::{key_hash, Hash256, SignatureVerifier};
    use crate::{image::TlvKind, Error, Result};

    /// How many keys the bootloader will trust at once.
    pub const MAX_KEYS: usize = 4;

    /// ECDSA P-256 keys.  Signatures are the 64 byte `r || s` form, made over
    /// the 32 byte image digest as a prehashed message.
    #[derive(Default)]
    pub struct P256Keys {
        keys: heapless::Vec<(Hash256, VerifyingKey), MAX_KEYS>,
    }

    impl P256Keys {
        pub fn new() -> P256Keys {
            P256Keys::default()
        }

        /// Trust a key, given as a SEC1 encoded point.
        pub fn add(&mut self, sec1: &[u8]) -> Result<()> {
            let point = EncodedPoint::from_bytes(sec1).map_err(|_| Error::InvalidKey)?;
            let key = VerifyingKey::from_encoded_point(&point).map_err(|_| Error::InvalidKey)?;
            self.keys
                .push((key_hash(sec1), key))
                .map_err(|_| Error::InvalidKey)
        }

        pub fn len(&self) -> usize {
            self.keys.len()
        }

        pub fn is_empty(&self) -> bool {
            self.keys.is_empty()
        }
    }

    impl SignatureVerifier for P256Keys {
        fn signature_kind(&self) -> TlvKind {
            TlvKind::ECDSA256
        }

        fn find_key(&self, keyhash: &[u8]) -> Option<usize> {
            if keyhash.is_empty() {
                return None;
            }
            self.keys.iter().position(|(hash, _)| hash.starts_with(keyhash))
        }

        fn verify(&self, key: usize, hash: &Hash256, signature: &[u8]) -> bool {
            let Some((_, key)) = self.keys.get(key) else {
                return false;
            };
            let Ok(signature) = Signature::from_slice(signature) else {
                return false;
            };
            key.verify_prehash(hash, &signature).is_ok()
        }
    }
}

#[cfg(feature = "p256")]
pub use ecdsa::P256Keys;
