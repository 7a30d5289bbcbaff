use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};

use crate::error::{ChatError, ChatResult};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// Ciphertext together with the nonce it was sealed under. Both columns are
/// stored; neither is ever serialized onto the wire.
#[derive(Debug, Clone)]
pub struct EncryptedPayload {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// At-rest encryption for private message bodies.
///
/// One ChaCha20-Poly1305 key per process, a fresh random nonce per call.
/// The AEAD tag makes tampering with stored ciphertext detectable on read.
pub struct MessageCipher {
    cipher: ChaCha20Poly1305,
}

impl MessageCipher {
    /// Fresh key from the OS RNG; nothing ever persists it.
    pub fn new_random() -> Self {
        let key = ChaCha20Poly1305::generate_key(&mut OsRng);
        Self {
            cipher: ChaCha20Poly1305::new(&key),
        }
    }

    /// Key pinned by deployment configuration (base64, 32 bytes).
    pub fn from_base64(encoded: &str) -> anyhow::Result<Self> {
        let bytes = BASE64.decode(encoded.trim())?;
        if bytes.len() != KEY_LEN {
            anyhow::bail!(
                "MESSAGE_KEY must decode to exactly {} bytes (got {})",
                KEY_LEN,
                bytes.len()
            );
        }
        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&bytes)),
        })
    }

    pub fn from_config(message_key: Option<&str>) -> anyhow::Result<Self> {
        match message_key {
            Some(encoded) => Self::from_base64(encoded),
            None => {
                tracing::warn!(
                    "MESSAGE_KEY not set; using a per-process key. Private messages \
                     stored before a restart will not decrypt afterwards"
                );
                Ok(Self::new_random())
            }
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> ChatResult<EncryptedPayload> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| ChatError::encryption(format!("seal failed: {:?}", e)))?;

        Ok(EncryptedPayload {
            ciphertext,
            nonce: nonce.to_vec(),
        })
    }

    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> ChatResult<String> {
        if nonce.len() != NONCE_LEN {
            return Err(ChatError::decryption(format!(
                "nonce must be {} bytes (got {})",
                NONCE_LEN,
                nonce.len()
            )));
        }

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| ChatError::decryption(format!("open failed: {:?}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|_| ChatError::decryption("plaintext is not valid UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let cipher = MessageCipher::new_random();
        let sealed = cipher.encrypt("secret greetings").unwrap();

        assert_eq!(sealed.nonce.len(), NONCE_LEN);
        assert_ne!(sealed.ciphertext, b"secret greetings".to_vec());

        let opened = cipher.decrypt(&sealed.ciphertext, &sealed.nonce).unwrap();
        assert_eq!(opened, "secret greetings");
    }

    #[test]
    fn nonces_are_fresh_per_call() {
        let cipher = MessageCipher::new_random();
        let a = cipher.encrypt("same input").unwrap();
        let b = cipher.encrypt("same input").unwrap();

        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let cipher = MessageCipher::new_random();
        let mut sealed = cipher.encrypt("integrity matters").unwrap();
        sealed.ciphertext[0] ^= 0xff;

        assert!(matches!(
            cipher.decrypt(&sealed.ciphertext, &sealed.nonce),
            Err(ChatError::Decryption(_))
        ));
    }

    #[test]
    fn mismatched_nonce_fails_to_open() {
        let cipher = MessageCipher::new_random();
        let sealed = cipher.encrypt("nonce binding").unwrap();
        let other = cipher.encrypt("other").unwrap();

        assert!(cipher.decrypt(&sealed.ciphertext, &other.nonce).is_err());
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let sealed = MessageCipher::new_random().encrypt("key binding").unwrap();
        let other = MessageCipher::new_random();

        assert!(other.decrypt(&sealed.ciphertext, &sealed.nonce).is_err());
    }

    #[test]
    fn pinned_key_must_be_32_bytes() {
        assert!(MessageCipher::from_base64("dG9vLXNob3J0").is_err());
        let full = BASE64.encode([7u8; KEY_LEN]);
        assert!(MessageCipher::from_base64(&full).is_ok());
    }

    #[test]
    fn pinned_key_decrypts_across_instances() {
        let encoded = BASE64.encode([42u8; KEY_LEN]);
        let first = MessageCipher::from_base64(&encoded).unwrap();
        let second = MessageCipher::from_base64(&encoded).unwrap();

        let sealed = first.encrypt("survives restarts").unwrap();
        assert_eq!(
            second.decrypt(&sealed.ciphertext, &sealed.nonce).unwrap(),
            "survives restarts"
        );
    }
}
