//! The `cbor_box` wire shape of spec.md §6: a sealed blob wrapped as
//! `[bstr(32) salt, bstr(16) mac, bstr(N) ciphertext]`. Used for both the
//! static header and the two archive header slots.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::error::{Error, Result, VefsError};

#[derive(Serialize, Deserialize)]
struct CborBoxWire {
    salt: ByteBuf,
    mac: ByteBuf,
    ciphertext: ByteBuf,
}

pub struct CborBox {
    pub salt: [u8; 32],
    pub mac: [u8; 16],
    pub ciphertext: Vec<u8>,
}

impl CborBox {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire = CborBoxWire {
            salt: ByteBuf::from(self.salt.to_vec()),
            mac: ByteBuf::from(self.mac.to_vec()),
            ciphertext: ByteBuf::from(self.ciphertext.clone()),
        };
        let mut out = Vec::new();
        ciborium::into_writer(&wire, &mut out).map_err(|_| Error::from(VefsError::Bad(std::io::Error::other("cbor encode failed"))))?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let wire: CborBoxWire =
            ciborium::from_reader(bytes).map_err(|_| Error::from(VefsError::CorruptIndexEntry))?;
        if wire.salt.len() != 32 || wire.mac.len() != 16 {
            return Err(VefsError::CorruptIndexEntry.into());
        }
        let mut salt = [0u8; 32];
        salt.copy_from_slice(&wire.salt);
        let mut mac = [0u8; 16];
        mac.copy_from_slice(&wire.mac);
        Ok(CborBox { salt, mac, ciphertext: wire.ciphertext.into_vec() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let b = CborBox { salt: [1u8; 32], mac: [2u8; 16], ciphertext: vec![9, 9, 9] };
        let encoded = b.encode().unwrap();
        let decoded = CborBox::decode(&encoded).unwrap();
        assert_eq!(decoded.salt, b.salt);
        assert_eq!(decoded.mac, b.mac);
        assert_eq!(decoded.ciphertext, b.ciphertext);
    }

    #[test]
    fn rejects_garbage() {
        assert!(CborBox::decode(&[0xff, 0x00, 0x01]).is_err());
    }
}
