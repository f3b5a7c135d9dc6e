use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
pub use secp256k1::{Error, PublicKey, SecretKey};
use secp256k1::{Message, SECP256K1};

use crate::Address;

/// Recoverable ECDSA signatures travel as `[r || s || v]`.
pub const SIGNATURE_LENGTH: usize = 65;

/// Signs the 32-byte prehash with the given secret key.
/// Returns the corresponding recoverable signature.
pub fn sign_prehash(secret_key: &SecretKey, prehash: [u8; 32]) -> [u8; SIGNATURE_LENGTH] {
    let (recid, signature) = SECP256K1
        .sign_ecdsa_recoverable(&Message::from_digest(prehash), secret_key)
        .serialize_compact();

    let mut full_sig = [0u8; SIGNATURE_LENGTH];
    full_sig[0..64].copy_from_slice(&signature);
    full_sig[64] = i32::from(recid) as u8;
    full_sig
}

/// Recovers the signer public key from the signature and prehash.
pub fn recover_from_prehash(
    prehash: [u8; 32],
    signature: &[u8; SIGNATURE_LENGTH],
) -> Result<PublicKey, Error> {
    let signature = RecoverableSignature::from_compact(
        &signature[0..64],
        RecoveryId::try_from(signature[64] as i32)?,
    )?;
    SECP256K1.recover_ecdsa(&Message::from_digest(prehash), &signature)
}

/// Recovers the signer address from the signature and prehash.
pub fn recover_address_from_prehash(
    prehash: [u8; 32],
    signature: &[u8; SIGNATURE_LENGTH],
) -> Result<Address, Error> {
    Ok(public_key_to_address(&recover_from_prehash(
        prehash, signature,
    )?))
}

/// An address is the lower 20 bytes of the keccak256 of the uncompressed public key.
pub fn public_key_to_address(public_key: &PublicKey) -> Address {
    let uncompressed = public_key.serialize_uncompressed();
    Address::from_raw_public_key(&uncompressed[1..])
}

#[cfg(test)]
mod tests {
    use secp256k1::{SecretKey, SECP256K1};

    use super::{public_key_to_address, recover_address_from_prehash, sign_prehash};

    #[test]
    fn sign_then_recover() {
        let secret = [
            1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24,
            25, 26, 27, 28, 29, 30, 31, 32,
        ];
        let secret_key = SecretKey::from_byte_array(&secret).unwrap();
        let address = public_key_to_address(&secret_key.public_key(SECP256K1));

        let prehash = *b"11111111111111111111111111111111";
        let signature = sign_prehash(&secret_key, prehash);

        let recovered = recover_address_from_prehash(prehash, &signature).unwrap();
        assert_eq!(recovered, address);
    }

    #[test]
    fn recover_rejects_garbage() {
        let prehash = *b"00000000000000000000000000000000";
        let mut signature = [0u8; 65];
        signature[64] = 9;
        assert!(recover_address_from_prehash(prehash, &signature).is_err());
    }
}
