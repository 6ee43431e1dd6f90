use crate::error::{CryptoError, Result};
use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use tracing::debug;

/// Ephemeral per-task secp256k1 keypair. Generated fresh for every dispatch
/// so no long-lived client identity exists on the wire.
#[derive(Clone)]
pub struct TaskKeypair {
    signing: SigningKey,
}

impl TaskKeypair {
    /// Generate a keypair, rejecting degenerate keys whose uncompressed
    /// public-key body starts with a zero nibble. Capped at `attempts`
    /// tries.
    pub fn generate(attempts: u32) -> Result<Self> {
        for attempt in 0..attempts {
            let signing = SigningKey::random(&mut OsRng);
            let keypair = Self { signing };
            if !keypair.has_weak_prefix() {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "Generated task keypair after retries");
                }
                return Ok(keypair);
            }
        }
        Err(CryptoError::KeygenFailed(format!(
            "no acceptable key in {} attempts",
            attempts
        )))
    }

    pub fn from_private_hex(private_key: &str) -> Result<Self> {
        let bytes = hex::decode(private_key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let signing = SigningKey::from_slice(&bytes)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { signing })
    }

    /// 32-byte scalar, hex.
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    /// Uncompressed SEC1 point (65 bytes, leading 0x04), hex.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_uncompressed())
    }

    pub fn public_key_uncompressed(&self) -> Vec<u8> {
        self.verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        *self.signing.verifying_key()
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    fn has_weak_prefix(&self) -> bool {
        // Body byte after the 0x04 format prefix; a zero leading nibble
        // marks the disallowed weak-prefix pattern.
        let uncompressed = self.public_key_uncompressed();
        uncompressed.get(1).map(|b| b >> 4 == 0).unwrap_or(true)
    }
}

impl std::fmt::Debug for TaskKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskKeypair({}...)", &self.public_key_hex()[..10])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_rejects_weak_prefix() {
        for _ in 0..32 {
            let keypair = TaskKeypair::generate(20).unwrap();
            let uncompressed = keypair.public_key_uncompressed();
            assert_eq!(uncompressed[0], 0x04);
            assert!(uncompressed[1] >> 4 != 0);
        }
    }

    #[test]
    fn test_private_hex_roundtrip() {
        let keypair = TaskKeypair::generate(20).unwrap();
        let restored = TaskKeypair::from_private_hex(&keypair.private_key_hex()).unwrap();
        assert_eq!(restored.public_key_hex(), keypair.public_key_hex());
    }

    #[test]
    fn test_from_private_hex_rejects_garbage() {
        assert!(TaskKeypair::from_private_hex("zz").is_err());
        assert!(TaskKeypair::from_private_hex("00").is_err());
    }
}
