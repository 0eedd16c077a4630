//! Built-in alias cipher: two-layer AES-256-GCM envelope.
//!
//! Every sealed value gets a fresh data key. The value is encrypted under
//! the data key, the data key under the master key, and both layers travel
//! together as a small base64 JSON document.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use super::AliasCipher;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// One AES-GCM layer: nonce plus ciphertext, base64 encoded.
#[derive(Serialize, Deserialize)]
struct Layer {
    nonce: String,
    ciphertext: String,
}

/// Remote representation of an alias value.
#[derive(Serialize, Deserialize)]
struct Envelope {
    data_key: Layer,
    value: Layer,
}

pub struct EnvelopeCipher {
    master_key: [u8; KEY_LEN],
}

impl Drop for EnvelopeCipher {
    fn drop(&mut self) {
        self.master_key.zeroize();
    }
}

impl EnvelopeCipher {
    pub fn new(master_key_hex: &str) -> anyhow::Result<Self> {
        Ok(Self {
            master_key: parse_master_key(master_key_hex)?,
        })
    }
}

impl AliasCipher for EnvelopeCipher {
    fn seal(&self, plaintext: &str) -> anyhow::Result<Vec<u8>> {
        let mut data_key = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut data_key[..]);

        let envelope = Envelope {
            value: seal_layer(&data_key[..], plaintext.as_bytes())?,
            data_key: seal_layer(&self.master_key, &data_key[..])?,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    fn open(&self, payload: &[u8]) -> anyhow::Result<String> {
        let envelope: Envelope = serde_json::from_slice(payload)?;

        let data_key = Zeroizing::new(open_layer(&self.master_key, &envelope.data_key)?);
        if data_key.len() != KEY_LEN {
            anyhow::bail!("data key has unexpected length {}", data_key.len());
        }
        let plaintext = open_layer(&data_key, &envelope.value)?;
        Ok(String::from_utf8(plaintext)?)
    }
}

fn cipher_for(key: &[u8]) -> anyhow::Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key).map_err(|_| anyhow::anyhow!("invalid AES-256 key length"))
}

fn seal_layer(key: &[u8], plaintext: &[u8]) -> anyhow::Result<Layer> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher_for(key)?
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| anyhow::anyhow!("alias encryption failed: {}", e))?;

    Ok(Layer {
        nonce: STANDARD.encode(nonce),
        ciphertext: STANDARD.encode(ciphertext),
    })
}

fn open_layer(key: &[u8], layer: &Layer) -> anyhow::Result<Vec<u8>> {
    let nonce = STANDARD.decode(&layer.nonce)?;
    if nonce.len() != NONCE_LEN {
        anyhow::bail!("malformed nonce");
    }
    let ciphertext = STANDARD.decode(&layer.ciphertext)?;
    cipher_for(key)?
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|e| anyhow::anyhow!("alias decryption failed: {}", e))
}

/// Decode the 64-hex-char master key.
pub fn parse_master_key(hex_key: &str) -> anyhow::Result<[u8; KEY_LEN]> {
    let bytes = Zeroizing::new(hex::decode(hex_key.trim())?);
    <[u8; KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
        anyhow::anyhow!(
            "TOKENSYNC_MASTER_KEY must be 64 hex chars (32 bytes), got {} bytes",
            bytes.len()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = EnvelopeCipher::new(MASTER_KEY).unwrap();
        let payload = cipher.seal("1700000000000").unwrap();
        assert_eq!(cipher.open(&payload).unwrap(), "1700000000000");
    }

    #[test]
    fn test_payload_does_not_contain_plaintext() {
        let cipher = EnvelopeCipher::new(MASTER_KEY).unwrap();
        let payload = cipher.seal("testUser-secret-comment").unwrap();
        let text = String::from_utf8_lossy(&payload);
        assert!(!text.contains("testUser-secret-comment"));
    }

    #[test]
    fn test_sealing_twice_differs() {
        let cipher = EnvelopeCipher::new(MASTER_KEY).unwrap();
        assert_ne!(cipher.seal("2000").unwrap(), cipher.seal("2000").unwrap());
    }

    #[test]
    fn test_wrong_key_fails_to_open() {
        let cipher = EnvelopeCipher::new(MASTER_KEY).unwrap();
        let other = EnvelopeCipher::new(&"ab".repeat(32)).unwrap();
        let payload = cipher.seal("2000").unwrap();
        assert!(other.open(&payload).is_err());
    }

    #[test]
    fn test_garbage_payload_is_an_error_not_a_panic() {
        let cipher = EnvelopeCipher::new(MASTER_KEY).unwrap();
        assert!(cipher.open(b"not json").is_err());
        let bad = br#"{"data_key":{"nonce":"AA==","ciphertext":"AA=="},"value":{"nonce":"AA==","ciphertext":"AA=="}}"#;
        assert!(cipher.open(bad).is_err());
    }

    #[test]
    fn test_master_key_length_is_checked() {
        assert!(parse_master_key("abcd").is_err());
        assert!(parse_master_key("zz").is_err());
        assert!(parse_master_key(MASTER_KEY).is_ok());
    }
}
