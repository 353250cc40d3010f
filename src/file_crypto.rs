//! C3 — per-file crypto context (spec.md §4.3). Owns `secret` and the
//! monotonic `secret_counter`; every sector of this file is sealed under a
//! key derived from `secret` and a freshly drawn salt, never reusing a
//! nonce for the life of `secret`.

use zeroize::Zeroize;

use crate::counter::{Counter, CounterState};
use crate::crypto::{kdf, CryptoProvider};
use crate::error::Result;

pub const SECTOR_SALT_LEN: usize = 32;

pub struct FileCryptoContext {
    secret: [u8; 32],
    secret_counter: Counter,
    /// Drawn once per archive-open session; folded into every derived salt
    /// so that two sessions never collide even if the counter were ever
    /// (incorrectly) reset.
    session_salt: [u8; 16],
}

impl FileCryptoContext {
    pub fn new(secret: [u8; 32], counter_state: CounterState, session_salt: [u8; 16]) -> Self {
        Self { secret, secret_counter: Counter::new(counter_state), session_salt }
    }

    pub fn secret(&self) -> &[u8; 32] {
        &self.secret
    }

    pub fn counter_snapshot(&self) -> CounterState {
        self.secret_counter.current()
    }

    /// A fresh context for the same file, picking up the counter where this
    /// one currently stands. Used when a file's crypto context needs to be
    /// reconstructed from a descriptor snapshot rather than shared directly.
    pub fn fork(&self) -> Self {
        Self::new(self.secret, self.secret_counter.current(), self.session_salt)
    }

    fn sector_salt(&self, counter: CounterState) -> Result<[u8; 32]> {
        let mut salt = [0u8; 32];
        kdf::kdf(&mut salt, &counter.to_le_bytes(), &[b"vefs/salt/Sector-Salt", &self.session_salt])?;
        Ok(salt)
    }

    fn sector_key_material(&self, provider: &dyn CryptoProvider, salt: &[u8; 32]) -> Result<Vec<u8>> {
        let mut key_material = vec![0u8; provider.key_material_size()];
        kdf::kdf(&mut key_material, &self.secret, &[b"vefs/prk/SectorPRK", salt])?;
        Ok(key_material)
    }

    /// Seals `plaintext` for sector `id`, drawing a fresh nonce from the
    /// counter. Returns the salt to store in the sector's 32-byte prefix
    /// and the MAC to store in the parent/descriptor. Refuses to seal for
    /// the master sector (id 0) — callers must route that write through
    /// the sector device's own static/archive-header path instead.
    pub fn seal_sector(
        &self,
        provider: &dyn CryptoProvider,
        id: u64,
        plaintext: &[u8],
        ciphertext_out: &mut [u8],
    ) -> Result<([u8; 32], [u8; 16])> {
        if id == crate::tree::record::NULL_SECTOR {
            return Err(crate::error::VefsError::InvalidArgument.into());
        }
        let counter = self.secret_counter.fetch_increment();
        let salt = self.sector_salt(counter)?;
        let key_material = self.sector_key_material(provider, &salt)?;
        let mut mac = [0u8; 16];
        provider.box_seal(ciphertext_out, &mut mac, &key_material, plaintext)?;
        Ok((salt, mac))
    }

    /// Opens a sector previously sealed with [`Self::seal_sector`] (or a
    /// sibling context sharing the same `secret`), given the on-disk salt
    /// and the MAC recorded by the parent/descriptor.
    pub fn unseal_sector(
        &self,
        provider: &dyn CryptoProvider,
        salt: &[u8; 32],
        ciphertext: &[u8],
        mac: &[u8; 16],
        plaintext_out: &mut [u8],
    ) -> Result<()> {
        let key_material = self.sector_key_material(provider, salt)?;
        provider.box_open(plaintext_out, &key_material, ciphertext, mac)
    }
}

impl Drop for FileCryptoContext {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Aes256GcmSivProvider;

    #[test]
    fn seal_then_unseal_round_trips() {
        let provider = Aes256GcmSivProvider::new();
        let ctx = FileCryptoContext::new([7u8; 32], CounterState(0), [1u8; 16]);
        let plaintext = b"hello, sector payload".to_vec();
        let mut ciphertext = vec![0u8; plaintext.len()];
        let (salt, mac) = ctx.seal_sector(&provider, 5, &plaintext, &mut ciphertext).unwrap();
        let mut recovered = vec![0u8; plaintext.len()];
        ctx.unseal_sector(&provider, &salt, &ciphertext, &mac, &mut recovered).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn never_reuses_salt_across_seals() {
        let provider = Aes256GcmSivProvider::new();
        let ctx = FileCryptoContext::new([7u8; 32], CounterState(0), [1u8; 16]);
        let plaintext = vec![0u8; 16];
        let mut ct_a = vec![0u8; 16];
        let mut ct_b = vec![0u8; 16];
        let (salt_a, _) = ctx.seal_sector(&provider, 1, &plaintext, &mut ct_a).unwrap();
        let (salt_b, _) = ctx.seal_sector(&provider, 1, &plaintext, &mut ct_b).unwrap();
        assert_ne!(salt_a, salt_b);
    }

    #[test]
    fn refuses_to_seal_master_sector() {
        let provider = Aes256GcmSivProvider::new();
        let ctx = FileCryptoContext::new([7u8; 32], CounterState(0), [1u8; 16]);
        let mut out = vec![0u8; 4];
        assert!(ctx.seal_sector(&provider, 0, &[0u8; 4], &mut out).is_err());
    }
}
