use crate::ecies;
use crate::error::{CryptoError, Result};
use crate::keys::TaskKeypair;
use crate::recovery::{address_of, keccak256, recover_public_key, SIGNATURE_LEN};
use dmesh_types::{Address, Task};
use tracing::warn;

/// Canonical digest a responder signs: Keccak-256 over the task id (hex)
/// concatenated with the decrypted plaintext.
pub fn result_digest(task_id_hex: &str, plaintext: &[u8]) -> [u8; 32] {
    let mut data = Vec::with_capacity(task_id_hex.len() + plaintext.len());
    data.extend_from_slice(task_id_hex.as_bytes());
    data.extend_from_slice(plaintext);
    keccak256(&data)
}

/// The sole authenticity check: the transport provides no sender identity.
/// `raw` is the 65-byte recoverable signature followed by the ECIES
/// ciphertext. Returns the plaintext and the recovered address only if that
/// address is one the task was actually dispatched to.
pub fn verify_truthful_node(task: &Task, raw: &[u8]) -> Result<(Vec<u8>, Address)> {
    if raw.len() <= SIGNATURE_LEN {
        return Err(CryptoError::InvalidSignature(format!(
            "result body too short: {} bytes",
            raw.len()
        )));
    }

    let (signature, ciphertext) = raw.split_at(SIGNATURE_LEN);
    let plaintext = ecies::decrypt(&task.private_key, ciphertext)?;

    let digest = result_digest(&task.id.to_hex(), &plaintext);
    let public_key = recover_public_key(signature, &digest)?;
    let address = address_of(&public_key)?;

    if !task.nodes.contains(&address) {
        warn!(task_id = %task.id, sender = %address, "Result from untrusted sender dropped");
        return Err(CryptoError::UntrustedSender);
    }

    Ok((plaintext, address))
}

/// Worker side of the scheme: encrypt `plaintext` to the task public key and
/// sign the canonical digest with the worker key. Produces the raw body
/// `verify_truthful_node` expects.
pub fn sign_result(
    worker: &TaskKeypair,
    task_id_hex: &str,
    task_public_key_hex: &str,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let ciphertext = ecies::encrypt(task_public_key_hex, plaintext)?;
    let digest = result_digest(task_id_hex, plaintext);

    let (sig, recid) = worker
        .signing_key()
        .sign_prehash_recoverable(&digest)
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;

    let mut raw = sig.to_bytes().to_vec();
    raw.push(recid.to_byte());
    raw.extend_from_slice(&ciphertext);
    Ok(raw)
}
