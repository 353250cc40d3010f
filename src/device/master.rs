//! The master sector's static header (spec.md §3, §6): a CBOR tuple
//! `[version=0, master_secret: bstr(64), master_counter: bstr(16)]`,
//! sealed under a key derived from the user PRK, wrapped in a
//! [`CborBox`], with a 4-byte big-endian length prefix.

use serde_bytes::ByteBuf;
use zeroize::Zeroize;

use crate::crypto::{kdf, CborBox, CryptoProvider};
use crate::error::{Error, Result, VefsError};

pub const MASTER_SECRET_LEN: usize = 64;
pub const MASTER_COUNTER_LEN: usize = 16;

pub struct StaticHeader {
    pub master_secret: [u8; MASTER_SECRET_LEN],
    pub master_counter: [u8; MASTER_COUNTER_LEN],
}

type Tuple = (u32, ByteBuf, ByteBuf);

impl StaticHeader {
    fn to_plaintext(&self) -> Result<Vec<u8>> {
        let tuple: Tuple = (0, ByteBuf::from(self.master_secret.to_vec()), ByteBuf::from(self.master_counter.to_vec()));
        let mut out = Vec::new();
        ciborium::into_writer(&tuple, &mut out).map_err(|_| Error::from(VefsError::Bad(std::io::Error::other("cbor encode"))))?;
        Ok(out)
    }

    fn from_plaintext(bytes: &[u8]) -> Result<Self> {
        let (version, secret, counter): Tuple =
            ciborium::from_reader(bytes).map_err(|_| Error::from(VefsError::CorruptIndexEntry))?;
        if version != 0 || secret.len() != MASTER_SECRET_LEN || counter.len() != MASTER_COUNTER_LEN {
            return Err(VefsError::CorruptIndexEntry.into());
        }
        let mut master_secret = [0u8; MASTER_SECRET_LEN];
        master_secret.copy_from_slice(&secret);
        let mut master_counter = [0u8; MASTER_COUNTER_LEN];
        master_counter.copy_from_slice(&counter);
        Ok(StaticHeader { master_secret, master_counter })
    }

    /// Derives the sealing key from `user_prk` and `salt` and seals the
    /// static header, returning the on-disk bytes of the `cbor_box`
    /// (without the 4-byte length prefix — the caller writes that).
    pub fn seal(&self, provider: &dyn CryptoProvider, user_prk: &[u8; 32], salt: [u8; 32]) -> Result<Vec<u8>> {
        let plaintext = self.to_plaintext()?;
        let mut key_material = vec![0u8; provider.key_material_size()];
        kdf::kdf(&mut key_material, user_prk, &[salt.as_slice()])?;
        let mut ciphertext = vec![0u8; plaintext.len()];
        let mut mac = [0u8; 16];
        provider.box_seal(&mut ciphertext, &mut mac, &key_material, &plaintext)?;
        CborBox { salt, mac, ciphertext }.encode()
    }

    /// Attempts to decrypt a sealed static header. Returns
    /// [`VefsError::TagMismatch`] (mapped by the caller to
    /// [`VefsError::WrongUserPrk`]) on authentication failure.
    pub fn open(provider: &dyn CryptoProvider, user_prk: &[u8; 32], sealed: &[u8]) -> Result<Self> {
        let boxed = CborBox::decode(sealed)?;
        let mut key_material = vec![0u8; provider.key_material_size()];
        kdf::kdf(&mut key_material, user_prk, &[boxed.salt.as_slice()])?;
        let mut plaintext = vec![0u8; boxed.ciphertext.len()];
        provider.box_open(&mut plaintext, &key_material, &boxed.ciphertext, &boxed.mac)?;
        Self::from_plaintext(&plaintext)
    }
}

impl Drop for StaticHeader {
    fn drop(&mut self) {
        self.master_secret.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Aes256GcmSivProvider;

    #[test]
    fn seal_open_round_trip() {
        let provider = Aes256GcmSivProvider::new();
        let header = StaticHeader { master_secret: [9u8; 64], master_counter: [0u8; 16] };
        let sealed = header.seal(&provider, &[1u8; 32], [2u8; 32]).unwrap();
        let opened = StaticHeader::open(&provider, &[1u8; 32], &sealed).unwrap();
        assert_eq!(opened.master_secret, header.master_secret);
        assert_eq!(opened.master_counter, header.master_counter);
    }

    #[test]
    fn wrong_prk_fails_to_authenticate() {
        let provider = Aes256GcmSivProvider::new();
        let header = StaticHeader { master_secret: [9u8; 64], master_counter: [0u8; 16] };
        let sealed = header.seal(&provider, &[1u8; 32], [2u8; 32]).unwrap();
        assert!(StaticHeader::open(&provider, &[9u8; 32], &sealed).is_err());
    }
}
