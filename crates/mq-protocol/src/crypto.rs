//! Symmetric crypto capability for register bodies.
//!
//! The cipher is handed to its users explicitly at construction; there is no
//! process-global instance.  Producer payload values are never touched by the
//! broker — end-to-end encryption of values is the producers' and consumers'
//! business.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// ChaCha20-Poly1305 nonce length.
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("ciphertext shorter than the {NONCE_LEN} byte nonce")]
    TooShort,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

/// Two-operation symmetric primitive.
pub trait Crypto: Send + Sync {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Pass-through cipher, used whenever no token is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCrypto;

impl Crypto for NoCrypto {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(data.to_vec())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(data.to_vec())
    }
}

/// ChaCha20-Poly1305 keyed from the shared token.
///
/// Key = SHA-256(token).  Each encryption draws a fresh random nonce which is
/// prepended to the ciphertext.
pub struct TokenCrypto {
    cipher: ChaCha20Poly1305,
}

impl TokenCrypto {
    pub fn new(token: &str) -> Self {
        let key: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        TokenCrypto {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }
}

impl Crypto for TokenCrypto {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, data)
            .map_err(|_| CryptoError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_LEN {
            return Err(CryptoError::TooShort);
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_crypto_round_trip() {
        let crypto = TokenCrypto::new("s3cret");
        let sealed = crypto.encrypt(b"register body").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"register body");
        assert_eq!(crypto.decrypt(&sealed).unwrap(), b"register body");
    }

    #[test]
    fn wrong_token_fails_to_decrypt() {
        let sealed = TokenCrypto::new("right").encrypt(b"body").unwrap();
        assert!(matches!(
            TokenCrypto::new("wrong").decrypt(&sealed),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let crypto = TokenCrypto::new("s3cret");
        let mut sealed = crypto.encrypt(b"body").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(crypto.decrypt(&sealed).is_err());
    }

    #[test]
    fn no_crypto_is_identity() {
        let crypto = NoCrypto;
        assert_eq!(crypto.encrypt(b"abc").unwrap(), b"abc");
        assert_eq!(crypto.decrypt(b"abc").unwrap(), b"abc");
    }
}
