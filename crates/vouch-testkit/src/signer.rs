//! Keyed-hash action signer

use vouch_core::{ActionSigner, Signature};

/// Signs with a blake3 keyed hash. Not a credential scheme; it only lets
/// tests tell signed, tampered and foreign actions apart.
#[derive(Clone)]
pub struct Blake3Signer {
    key: [u8; 32],
}

impl Blake3Signer {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Derive the key from a label
    pub fn for_label(label: &str) -> Self {
        Self::new(*blake3::hash(label.as_bytes()).as_bytes())
    }
}

impl ActionSigner for Blake3Signer {
    fn sign(&self, message: &[u8]) -> Signature {
        Signature(blake3::keyed_hash(&self.key, message).as_bytes().to_vec())
    }

    fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(bytes) = <[u8; 32]>::try_from(signature.0.as_slice()) else {
            return false;
        };
        blake3::keyed_hash(&self.key, message) == blake3::Hash::from(bytes)
    }
}
