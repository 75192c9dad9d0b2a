//! Key material loading.

use crate::error::{SignerError, SignerResult};
use base64::Engine;
use k256::ecdsa::SigningKey;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use stevedore_core::address::Address;

/// The JSON body of a hex-wrapped key export.
#[derive(Deserialize)]
struct KeyExport {
    #[serde(rename = "Type")]
    key_type: String,
    #[serde(rename = "PrivateKey")]
    private_key: String,
}

/// A secp256k1 secret key.
pub struct SecretKey {
    inner: SigningKey,
}

impl SecretKey {
    /// Parse the standard wallet export: hex-encoded JSON carrying the key
    /// type and the base64 secret scalar.
    pub fn from_export(s: &str) -> SignerResult<Self> {
        let raw = hex::decode(s.trim())
            .map_err(|e| SignerError::KeyParsing(format!("not hex: {e}")))?;
        let export: KeyExport = serde_json::from_slice(&raw)
            .map_err(|e| SignerError::KeyParsing(format!("bad key json: {e}")))?;
        if export.key_type != "secp256k1" {
            return Err(SignerError::UnsupportedKeyType(export.key_type));
        }
        let scalar = base64::engine::general_purpose::STANDARD
            .decode(&export.private_key)
            .map_err(|e| SignerError::KeyParsing(format!("bad base64 scalar: {e}")))?;
        let inner = SigningKey::from_slice(&scalar)
            .map_err(|e| SignerError::KeyParsing(format!("invalid scalar: {e}")))?;
        Ok(Self { inner })
    }

    /// Encode in the export format accepted by [`SecretKey::from_export`].
    pub fn to_export(&self) -> String {
        let scalar = base64::engine::general_purpose::STANDARD.encode(self.inner.to_bytes());
        let json = format!(r#"{{"Type":"secp256k1","PrivateKey":"{scalar}"}}"#);
        hex::encode(json.as_bytes())
    }

    /// The robust address this key controls.
    pub fn address(&self) -> Address {
        let pubkey = self.inner.verifying_key().to_encoded_point(false);
        Address::from_secp_pubkey(pubkey.as_bytes())
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.inner
    }

    /// Generate a fresh key. Test and bootstrap tooling only.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut rng = rand::rngs::OsRng;
        loop {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            // rejection-samples the negligible out-of-order scalars
            if let Ok(inner) = SigningKey::from_slice(&bytes) {
                return Self { inner };
            }
        }
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never expose key material, not even in debug output
        write!(f, "SecretKey({})", self.address())
    }
}

/// A directory of per-address key files: `<dir>/<robust-address>.key`.
pub struct Keystore {
    dir: PathBuf,
}

impl Keystore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Default location: `~/.keystore`.
    pub fn default_location() -> SignerResult<Self> {
        let home = std::env::var_os("HOME").ok_or_else(|| {
            SignerError::KeyParsing("HOME is unset, cannot locate keystore".into())
        })?;
        Ok(Self::new(PathBuf::from(home).join(".keystore")))
    }

    /// Load the key for a robust address. A missing file is a
    /// [`SignerError::MissingKey`], which callers treat as fatal for the
    /// affected client.
    pub fn load(&self, address: &Address) -> SignerResult<SecretKey> {
        let path = self.dir.join(format!("{address}.key"));
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SignerError::MissingKey(address.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        // only the first line is key material; the rest is operator notes
        let line = content.lines().next().unwrap_or_default();
        let key = SecretKey::from_export(line)?;
        if &key.address() != address {
            return Err(SignerError::KeyParsing(format!(
                "key file {} controls {}, not {address}",
                path.display(),
                key.address()
            )));
        }
        Ok(key)
    }

    /// Write a key file for its own address. Bootstrap tooling only.
    pub fn store(&self, key: &SecretKey) -> SignerResult<Address> {
        std::fs::create_dir_all(&self.dir)?;
        let address = key.address();
        let path = self.dir.join(format!("{address}.key"));
        std::fs::write(path, key.to_export())?;
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_roundtrip() {
        let key = SecretKey::generate();
        let restored = SecretKey::from_export(&key.to_export()).unwrap();
        assert_eq!(restored.address(), key.address());
    }

    #[test]
    fn rejects_non_secp_exports() {
        let json = r#"{"Type":"bls","PrivateKey":"AAAA"}"#;
        let err = SecretKey::from_export(&hex::encode(json)).unwrap_err();
        assert!(matches!(err, SignerError::UnsupportedKeyType(_)));
    }

    #[test]
    fn keystore_load_by_address() {
        let dir = tempfile::tempdir().unwrap();
        let ks = Keystore::new(dir.path());

        let key = SecretKey::generate();
        let address = ks.store(&key).unwrap();

        let loaded = ks.load(&address).unwrap();
        assert_eq!(loaded.address(), address);
    }

    #[test]
    fn missing_key_is_its_own_error() {
        let dir = tempfile::tempdir().unwrap();
        let ks = Keystore::new(dir.path());
        let absent = SecretKey::generate().address();
        assert!(matches!(ks.load(&absent), Err(SignerError::MissingKey(_))));
    }
}
