//! C1 — the crypto provider capability set (spec.md §4.1).
//!
//! `CryptoProvider` is the seam the archive engine never reaches around:
//! every seal/open, every random byte, every constant-time compare goes
//! through here. The AEAD primitive itself is parameterized, matching the
//! spec's "treated as a parameterized `crypto_provider`" framing — the
//! shipped implementation uses AES-256-GCM-SIV (nonce-misuse resistant,
//! which matters here because nonces are derived from a counter rather than
//! drawn fresh from the RNG).

use aes_gcm_siv::aead::{Aead, KeyInit, Payload};
use aes_gcm_siv::{Aes256GcmSiv, Nonce};
use rand_core::RngCore;
use subtle::ConstantTimeEq;

use crate::error::{Error, Result, VefsError};

/// Size in bytes of the opaque "key material" blob a [`CryptoProvider`]
/// consumes: for AES-256-GCM-SIV this is a 32-byte key followed by a
/// 12-byte nonce.
pub trait CryptoProvider: Send + Sync {
    /// Size in bytes of the key material `box_seal`/`box_open` expect.
    fn key_material_size(&self) -> usize;

    /// Authenticated encryption. Fails only on programmer error (wrong
    /// buffer sizes) — never on a "bad" key, since any 32-byte value is a
    /// valid AES-256 key.
    fn box_seal(&self, ciphertext_out: &mut [u8], mac_out: &mut [u8; 16], key_material: &[u8], plaintext: &[u8]) -> Result<()>;

    /// Authenticated decryption. Fails with [`VefsError::TagMismatch`] on
    /// authentication failure.
    fn box_open(&self, plaintext_out: &mut [u8], key_material: &[u8], ciphertext: &[u8], mac: &[u8; 16]) -> Result<()>;

    /// Fills `out` with cryptographically strong random bytes.
    fn random_bytes(&self, out: &mut [u8]) -> Result<()>;

    /// Constant-time lexicographic compare. Fails with
    /// [`VefsError::InvalidArgument`] on length mismatch or an empty slice.
    fn ct_compare(&self, a: &[u8], b: &[u8]) -> Result<std::cmp::Ordering> {
        if a.is_empty() || b.is_empty() || a.len() != b.len() {
            return Err(VefsError::InvalidArgument.into());
        }
        // ct_eq gives us equality in constant time; for the header-selection
        // use case (comparing two monotonic counters) we only need equality
        // plus an ordering fallback, and the fallback need not itself be
        // constant-time since it only runs once equality is already false.
        if bool::from(a.ct_eq(b)) {
            Ok(std::cmp::Ordering::Equal)
        } else {
            Ok(a.cmp(b))
        }
    }
}

/// Key material layout consumed by [`Aes256GcmSivProvider`]: 32-byte key
/// followed by a 12-byte nonce.
pub const AES256_GCM_SIV_KEY_MATERIAL_LEN: usize = 32 + 12;

/// The AEAD provider this crate ships. A fresh instance per archive open;
/// holds no mutable state of its own.
pub struct Aes256GcmSivProvider {
    rng: parking_lot::Mutex<rand_chacha::ChaCha20Rng>,
}

impl Aes256GcmSivProvider {
    pub fn new() -> Self {
        use rand_core::SeedableRng;
        Self { rng: parking_lot::Mutex::new(rand_chacha::ChaCha20Rng::from_entropy()) }
    }
}

impl Default for Aes256GcmSivProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoProvider for Aes256GcmSivProvider {
    fn key_material_size(&self) -> usize {
        AES256_GCM_SIV_KEY_MATERIAL_LEN
    }

    fn box_seal(&self, ciphertext_out: &mut [u8], mac_out: &mut [u8; 16], key_material: &[u8], plaintext: &[u8]) -> Result<()> {
        if key_material.len() != self.key_material_size() || ciphertext_out.len() != plaintext.len() {
            return Err(VefsError::InvalidArgument.into());
        }
        let (key, nonce) = key_material.split_at(32);
        let cipher = Aes256GcmSiv::new_from_slice(key).map_err(|_| Error::from(VefsError::InvalidArgument))?;
        let nonce = Nonce::from_slice(nonce);
        let sealed = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad: &[] })
            .map_err(|_| Error::from(VefsError::Bad(std::io::Error::other("aead seal failed"))))?;
        let (ct, tag) = sealed.split_at(plaintext.len());
        ciphertext_out.copy_from_slice(ct);
        mac_out.copy_from_slice(tag);
        Ok(())
    }

    fn box_open(&self, plaintext_out: &mut [u8], key_material: &[u8], ciphertext: &[u8], mac: &[u8; 16]) -> Result<()> {
        if key_material.len() != self.key_material_size() || ciphertext.len() != plaintext_out.len() {
            return Err(VefsError::InvalidArgument.into());
        }
        let (key, nonce) = key_material.split_at(32);
        let cipher = Aes256GcmSiv::new_from_slice(key).map_err(|_| Error::from(VefsError::InvalidArgument))?;
        let nonce = Nonce::from_slice(nonce);
        let mut combined = Vec::with_capacity(ciphertext.len() + 16);
        combined.extend_from_slice(ciphertext);
        combined.extend_from_slice(mac.as_slice());
        let opened = cipher
            .decrypt(nonce, Payload { msg: &combined, aad: &[] })
            .map_err(|_| Error::from(VefsError::TagMismatch))?;
        plaintext_out.copy_from_slice(&opened);
        Ok(())
    }

    fn random_bytes(&self, out: &mut [u8]) -> Result<()> {
        self.rng.lock().fill_bytes(out);
        Ok(())
    }
}
