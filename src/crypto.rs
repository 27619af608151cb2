use anyhow::{anyhow, Result};
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Symmetric cipher for socket payloads and video frames. The key is
/// derived from the shared passphrase configured on both ends.
pub struct TransportCipher {
    key: [u8; 32],
}

impl TransportCipher {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        TransportCipher {
            key: hasher.finalize().into(),
        }
    }

    /// Seal `clear` into a self-contained blob: nonce || tag || ciphertext.
    pub fn encrypt(&self, clear: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let mut ciphertext = clear.to_vec();
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut ciphertext)
            .map_err(|_| anyhow!("payload encryption failed"))?;
        let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(anyhow!("encrypted payload truncated"));
        }
        let nonce = &blob[..NONCE_LEN];
        let tag = &blob[NONCE_LEN..NONCE_LEN + TAG_LEN];
        let mut clear = blob[NONCE_LEN + TAG_LEN..].to_vec();
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                b"",
                &mut clear,
                Tag::from_slice(tag),
            )
            .map_err(|_| anyhow!("payload decryption failed"))?;
        Ok(clear)
    }
}

impl Drop for TransportCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}
