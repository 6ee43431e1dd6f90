use crate::error::{CryptoError, Result};
use crate::keys::TaskKeypair;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use hkdf::Hkdf;
use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::RngCore;
use sha2::Sha256;

const NONCE_LEN: usize = 12;
const EPHEMERAL_LEN: usize = 33;
const KDF_INFO: &[u8] = b"dmesh-ecies-v1";

/// ECIES over secp256k1: ephemeral ECDH, HKDF-SHA256, AES-256-GCM.
/// Layout: `ephemeral_compressed(33) || nonce(12) || ciphertext`.
pub fn encrypt(public_key_hex: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
    let recipient = parse_public_key(public_key_hex)?;

    let ephemeral = SigningKey::random(&mut OsRng);
    let key = derive_key(&ephemeral, &recipient);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut out = ephemeral
        .verifying_key()
        .to_encoded_point(true)
        .as_bytes()
        .to_vec();
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt(private_key_hex: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < EPHEMERAL_LEN + NONCE_LEN {
        return Err(CryptoError::DecryptionFailed(
            "ciphertext too short".into(),
        ));
    }

    let keypair = TaskKeypair::from_private_hex(private_key_hex)?;
    let (ephemeral_bytes, rest) = ciphertext.split_at(EPHEMERAL_LEN);
    let (nonce_bytes, body) = rest.split_at(NONCE_LEN);

    let ephemeral = VerifyingKey::from_sec1_bytes(ephemeral_bytes)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

    let key = derive_key(keypair.signing_key(), &ephemeral);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, body)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

fn derive_key(secret: &SigningKey, public: &VerifyingKey) -> [u8; 32] {
    let shared = k256::ecdh::diffie_hellman(secret.as_nonzero_scalar(), public.as_affine());
    let hk = Hkdf::<Sha256>::new(None, shared.raw_secret_bytes());
    let mut okm = [0u8; 32];
    // 32-byte output never exceeds the HKDF expansion limit
    hk.expand(KDF_INFO, &mut okm).unwrap();
    okm
}

fn parse_public_key(public_key_hex: &str) -> Result<VerifyingKey> {
    let bytes =
        hex::decode(public_key_hex).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    VerifyingKey::from_sec1_bytes(&bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let keypair = TaskKeypair::generate(20).unwrap();
        let plaintext = b"the workflow payload";

        let ciphertext = encrypt(&keypair.public_key_hex(), plaintext).unwrap();
        let decrypted = decrypt(&keypair.private_key_hex(), &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let keypair = TaskKeypair::generate(20).unwrap();
        let other = TaskKeypair::generate(20).unwrap();

        let ciphertext = encrypt(&keypair.public_key_hex(), b"secret").unwrap();
        assert!(matches!(
            decrypt(&other.private_key_hex(), &ciphertext),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_decrypt_rejects_truncated_input() {
        let keypair = TaskKeypair::generate(20).unwrap();
        assert!(matches!(
            decrypt(&keypair.private_key_hex(), &[0u8; 10]),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_decrypt_rejects_tampered_body() {
        let keypair = TaskKeypair::generate(20).unwrap();
        let mut ciphertext = encrypt(&keypair.public_key_hex(), b"payload").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;
        assert!(decrypt(&keypair.private_key_hex(), &ciphertext).is_err());
    }
}
