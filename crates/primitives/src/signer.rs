use secp256k1::{SecretKey, SECP256K1};

use crate::crypto::{public_key_to_address, sign_prehash, SIGNATURE_LENGTH};
use crate::Address;

/// Holds a validator secret key and signs consensus payloads with it.
#[derive(Clone, Copy, Debug)]
pub struct Signer {
    secret_key: SecretKey,
    address: Address,
}

impl Signer {
    pub fn new(secret: [u8; 32]) -> anyhow::Result<Self> {
        let secret_key = SecretKey::from_byte_array(&secret)?;
        Ok(Self {
            address: public_key_to_address(&secret_key.public_key(SECP256K1)),
            secret_key,
        })
    }

    pub fn from_bytes(secret: impl AsRef<[u8]>) -> anyhow::Result<Self> {
        Self::new(secret.as_ref().try_into()?)
    }

    pub fn from_str(secret: impl AsRef<str>) -> anyhow::Result<Self> {
        let secret = secret.as_ref().trim_start_matches("0x");
        Self::from_bytes(hex::decode(secret)?)
    }

    pub fn sign_prehash(&self, prehash: [u8; 32]) -> [u8; SIGNATURE_LENGTH] {
        sign_prehash(&self.secret_key, prehash)
    }

    #[inline]
    pub fn address(&self) -> Address {
        self.address
    }

    #[cfg(feature = "test-helpers")]
    pub fn random() -> Self {
        loop {
            let secret: [u8; 32] = rand::random();
            if let Ok(signer) = Self::new(secret) {
                return signer;
            }
        }
    }
}
