//! Payload signing and verification.

use crate::error::{SignerError, SignerResult};
use crate::key::Keystore;
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, VerifyingKey};
use stevedore_core::address::{signing_digest, Address};
use stevedore_core::deal::Signature;

/// Signs arbitrary chain payloads with keys resolved from a [`Keystore`].
pub struct WalletSigner {
    keystore: Keystore,
}

impl WalletSigner {
    pub fn new(keystore: Keystore) -> Self {
        Self { keystore }
    }

    /// Sign `payload` with the key controlling `client`. The chain signature
    /// format is the 64-byte compact ECDSA signature followed by the
    /// recovery byte.
    pub fn sign(&self, client: &Address, payload: &[u8]) -> SignerResult<Signature> {
        if client.is_id() {
            return Err(SignerError::Signing(format!(
                "{client} is an ID address; dereference to its robust form first"
            )));
        }
        let key = self.keystore.load(client)?;
        let digest = signing_digest(payload);
        let (sig, recovery) = key
            .signing_key()
            .sign_prehash_recoverable(&digest)
            .map_err(|e| SignerError::Signing(e.to_string()))?;

        let mut bytes = sig.to_bytes().to_vec();
        bytes.push(recovery.to_byte());
        Ok(Signature::new_secp256k1(bytes))
    }
}

/// Verify a secp256k1 chain signature: recover the public key from the
/// digest and check that it controls `client`.
pub fn verify_signature(
    payload: &[u8],
    signature: &Signature,
    client: &Address,
) -> SignerResult<()> {
    let (sig_bytes, recovery_byte) = match signature.bytes.len() {
        65 => (&signature.bytes[..64], signature.bytes[64]),
        n => {
            return Err(SignerError::Signing(format!(
                "expected 65 signature bytes, got {n}"
            )))
        }
    };
    let sig = EcdsaSignature::from_slice(sig_bytes)
        .map_err(|e| SignerError::Signing(e.to_string()))?;
    let recovery = RecoveryId::from_byte(recovery_byte)
        .ok_or_else(|| SignerError::Signing(format!("bad recovery byte {recovery_byte}")))?;

    let digest = signing_digest(payload);
    let pubkey = VerifyingKey::recover_from_prehash(&digest, &sig, recovery)
        .map_err(|_| SignerError::VerificationFailed)?;

    let recovered = Address::from_secp_pubkey(pubkey.to_encoded_point(false).as_bytes());
    if &recovered != client {
        return Err(SignerError::VerificationFailed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::SecretKey;

    fn signer_with_key() -> (tempfile::TempDir, WalletSigner, Address) {
        let dir = tempfile::tempdir().unwrap();
        let ks = Keystore::new(dir.path());
        let address = ks.store(&SecretKey::generate()).unwrap();
        (dir, WalletSigner::new(ks), address)
    }

    #[test]
    fn sign_verify_roundtrip() {
        let (_dir, signer, address) = signer_with_key();
        let payload = b"canonical cbor proposal bytes";
        let sig = signer.sign(&address, payload).unwrap();
        verify_signature(payload, &sig, &address).unwrap();
    }

    #[test]
    fn verification_rejects_tampered_payload() {
        let (_dir, signer, address) = signer_with_key();
        let sig = signer.sign(&address, b"payload one").unwrap();
        assert!(matches!(
            verify_signature(b"payload two", &sig, &address),
            Err(SignerError::VerificationFailed)
        ));
    }

    #[test]
    fn verification_rejects_wrong_client() {
        let (_d1, signer, address) = signer_with_key();
        let (_d2, _, other) = signer_with_key();
        let sig = signer.sign(&address, b"payload").unwrap();
        assert!(verify_signature(b"payload", &sig, &other).is_err());
    }

    #[test]
    fn refuses_to_sign_for_id_addresses() {
        let (_dir, signer, _) = signer_with_key();
        let err = signer.sign(&Address::Id(42), b"x").unwrap_err();
        assert!(matches!(err, SignerError::Signing(_)));
    }
}
