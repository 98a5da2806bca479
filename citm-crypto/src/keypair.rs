use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

/// Default modulus size for generated account keys.
pub const KEY_BITS: usize = 2048;

/// A SHA-256 fingerprint of a public key's DER encoding.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Fingerprint, CryptoError> {
        let bytes = hex::decode(s.trim())
            .map_err(|_| CryptoError::Param(format!("bad fingerprint hex: {s:?}")))?;
        Fingerprint::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Fingerprint, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::Param(format!("fingerprint must be 32 bytes, got {}", bytes.len())))?;
        Ok(Fingerprint(arr))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

/// A peer's public key: the RSA key, its PEM, and its fingerprint.
/// Read-only after creation; share it with `Arc`.
#[derive(Debug, Clone)]
pub struct PublicKey {
    key: RsaPublicKey,
    pem: String,
    fingerprint: Fingerprint,
}

impl PublicKey {
    pub fn from_pem(pem: &str) -> Result<PublicKey, CryptoError> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| CryptoError::Pem(e.to_string()))?;
        PublicKey::from_key(key)
    }

    fn from_key(key: RsaPublicKey) -> Result<PublicKey, CryptoError> {
        let der = key
            .to_public_key_der()
            .map_err(|e| CryptoError::Pem(e.to_string()))?;
        let fingerprint = Fingerprint(Sha256::digest(der.as_bytes()).into());
        let pem = key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Pem(e.to_string()))?;
        Ok(PublicKey { key, pem, fingerprint })
    }

    pub fn rsa(&self) -> &RsaPublicKey {
        &self.key
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

/// The account owner's keypair.
pub struct Keypair {
    private: RsaPrivateKey,
    public: Arc<PublicKey>,
}

impl Keypair {
    /// Generate a fresh key.  This blocks for a while; callers on the
    /// async side use `spawn_blocking`.
    pub fn generate(bits: usize) -> Result<Keypair, CryptoError> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, bits)?;
        Keypair::from_private(private)
    }

    fn from_private(private: RsaPrivateKey) -> Result<Keypair, CryptoError> {
        let public = Arc::new(PublicKey::from_key(RsaPublicKey::from(&private))?);
        Ok(Keypair { private, public })
    }

    pub fn from_pem(pem: &str) -> Result<Keypair, CryptoError> {
        let private =
            RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| CryptoError::Pem(e.to_string()))?;
        Keypair::from_private(private)
    }

    pub fn to_pem(&self) -> Result<String, CryptoError> {
        Ok(self
            .private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Pem(e.to_string()))?
            .to_string())
    }

    pub fn load(path: &Path) -> Result<Keypair, CryptoError> {
        let pem = std::fs::read_to_string(path)?;
        Keypair::from_pem(&pem)
    }

    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        std::fs::write(path, self.to_pem()?)?;
        Ok(())
    }

    pub fn private(&self) -> &RsaPrivateKey {
        &self.private
    }

    pub fn public(&self) -> &Arc<PublicKey> {
        &self.public
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        self.public.fingerprint()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never log private material
        write!(f, "Keypair({})", self.fingerprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_roundtrip_and_fingerprint_stability() {
        let kp = Keypair::generate(KEY_BITS).unwrap();
        let pem = kp.to_pem().unwrap();
        let kp2 = Keypair::from_pem(&pem).unwrap();
        assert_eq!(kp.fingerprint(), kp2.fingerprint());

        let public = PublicKey::from_pem(kp.public().pem()).unwrap();
        assert_eq!(public.fingerprint(), kp.fingerprint());
    }

    #[test]
    fn save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mykey.pem");
        let kp = Keypair::generate(KEY_BITS).unwrap();
        kp.save(&path).unwrap();
        let loaded = Keypair::load(&path).unwrap();
        assert_eq!(loaded.fingerprint(), kp.fingerprint());
    }

    #[test]
    fn fingerprint_hex_roundtrip() {
        let fpr = Fingerprint([7u8; 32]);
        assert_eq!(Fingerprint::from_hex(&fpr.hex()).unwrap(), fpr);
        assert!(Fingerprint::from_hex("abcd").is_err());
    }
}
