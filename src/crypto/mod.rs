pub mod cbor_box;
pub mod kdf;
pub mod provider;

pub use cbor_box::CborBox;
pub use kdf::kdf;
pub use provider::{Aes256GcmSivProvider, CryptoProvider};
