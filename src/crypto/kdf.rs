//! The archive-wide key derivation function (spec.md §4.1).
//!
//! Built as a keyed extract-then-expand construction with a fixed domain
//! separator, on top of HKDF-SHA-512/256 (`sha2`, `hkdf`). Call sites
//! concatenate their domain parts in order, exactly as spec.md prescribes;
//! the concatenation becomes the HKDF `info` parameter.

use hkdf::Hkdf;
use sha2::Sha512_256;

use crate::error::{Error, Result, VefsError};

/// Fixed 16-byte domain separation tag, folded into the HKDF `info` ahead
/// of every call site's domain parts.
pub const PERSONALIZATION: &[u8; 16] = b"vefs/kdf/v1-2026";

/// Derives `prk_out.len()` bytes of key material from `input_key`, binding
/// in the concatenation of `domain_parts` (in order) plus the fixed
/// personalization tag.
pub fn kdf(prk_out: &mut [u8], input_key: &[u8], domain_parts: &[&[u8]]) -> Result<()> {
    if prk_out.is_empty() || input_key.is_empty() {
        return Err(VefsError::InvalidArgument.into());
    }
    let mut info = Vec::with_capacity(PERSONALIZATION.len() + domain_parts.iter().map(|p| p.len()).sum::<usize>());
    info.extend_from_slice(PERSONALIZATION);
    for part in domain_parts {
        info.extend_from_slice(part);
    }
    let hk = Hkdf::<Sha512_256>::new(None, input_key);
    hk.expand(&info, prk_out).map_err(|_| Error::from(VefsError::InvalidArgument))
}

/// Convenience for the common case of a single domain part.
pub fn kdf1(prk_out: &mut [u8], input_key: &[u8], domain: &[u8]) -> Result<()> {
    kdf(prk_out, input_key, &[domain])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_input() {
        let mut a = [0u8; 44];
        let mut b = [0u8; 44];
        kdf(&mut a, b"master-secret-stand-in-32-bytes", &[b"vefs/salt/Sector-Salt", b"1"]).unwrap();
        kdf(&mut b, b"master-secret-stand-in-32-bytes", &[b"vefs/salt/Sector-Salt", b"1"]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn domain_parts_order_matters() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        kdf(&mut a, b"input-key-material-stand-in-here", &[b"a", b"b"]).unwrap();
        kdf(&mut b, b"input-key-material-stand-in-here", &[b"b", b"a"]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_empty_input() {
        let mut out = [0u8; 32];
        assert!(kdf(&mut out, b"", &[b"x"]).is_err());
    }
}
