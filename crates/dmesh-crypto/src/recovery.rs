use crate::error::{CryptoError, Result};
use dmesh_types::Address;
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use sha3::{Digest, Keccak256};

pub const SIGNATURE_LEN: usize = 65;

/// Recover the compressed public key from a 65-byte recoverable ECDSA
/// signature over a 32-byte message digest. The recovery byte sits at index
/// 64; Ethereum-style 27/28 values are normalized.
pub fn recover_public_key(signature: &[u8], digest: &[u8; 32]) -> Result<Vec<u8>> {
    if signature.len() != SIGNATURE_LEN {
        return Err(CryptoError::InvalidSignature(format!(
            "expected {} bytes, got {}",
            SIGNATURE_LEN,
            signature.len()
        )));
    }

    let sig = Signature::from_slice(&signature[..64])
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;

    let mut v = signature[64];
    if v >= 27 {
        v -= 27;
    }
    let recovery_id = RecoveryId::from_byte(v)
        .ok_or_else(|| CryptoError::InvalidSignature(format!("recovery byte {}", v)))?;

    let verifying = VerifyingKey::recover_from_prehash(digest, &sig, recovery_id)
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;

    Ok(verifying.to_encoded_point(true).as_bytes().to_vec())
}

/// Derive a node address: Keccak-256 of the public key with its leading
/// format byte stripped, last 20 bytes.
pub fn address_of(public_key: &[u8]) -> Result<Address> {
    let body = match public_key.len() {
        65 => &public_key[1..],
        64 => public_key,
        33 => {
            // Compressed input is decompressed first so the digest always
            // covers the full 64-byte point.
            let verifying = VerifyingKey::from_sec1_bytes(public_key)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            return address_of(verifying.to_encoded_point(false).as_bytes());
        }
        n => {
            return Err(CryptoError::InvalidKey(format!(
                "unexpected public key length {}",
                n
            )))
        }
    };

    let digest = Keccak256::digest(body);
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&digest[12..]);
    Ok(Address::from_bytes(bytes))
}

/// Keccak-256 convenience used for envelope digests.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::TaskKeypair;

    #[test]
    fn test_recover_matches_signer() {
        let keypair = TaskKeypair::generate(20).unwrap();
        let digest = keccak256(b"message");
        let (sig, recid) = keypair
            .signing_key()
            .sign_prehash_recoverable(&digest)
            .unwrap();

        let mut raw = sig.to_bytes().to_vec();
        raw.push(recid.to_byte());

        let recovered = recover_public_key(&raw, &digest).unwrap();
        let expected = keypair.verifying_key().to_encoded_point(true);
        assert_eq!(recovered, expected.as_bytes());
    }

    #[test]
    fn test_recover_accepts_ethereum_v() {
        let keypair = TaskKeypair::generate(20).unwrap();
        let digest = keccak256(b"message");
        let (sig, recid) = keypair
            .signing_key()
            .sign_prehash_recoverable(&digest)
            .unwrap();

        let mut raw = sig.to_bytes().to_vec();
        raw.push(recid.to_byte() + 27);

        let recovered = recover_public_key(&raw, &digest).unwrap();
        assert_eq!(
            recovered,
            keypair.verifying_key().to_encoded_point(true).as_bytes()
        );
    }

    #[test]
    fn test_recover_rejects_short_signature() {
        let digest = [0u8; 32];
        assert!(matches!(
            recover_public_key(&[0u8; 64], &digest),
            Err(CryptoError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_address_consistent_across_encodings() {
        let keypair = TaskKeypair::generate(20).unwrap();
        let uncompressed = keypair.public_key_uncompressed();
        let compressed = keypair.verifying_key().to_encoded_point(true);

        let a1 = address_of(&uncompressed).unwrap();
        let a2 = address_of(compressed.as_bytes()).unwrap();
        assert_eq!(a1, a2);
    }

    #[test]
    fn test_address_rejects_odd_lengths() {
        assert!(address_of(&[0u8; 17]).is_err());
    }
}
