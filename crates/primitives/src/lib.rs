pub use alloy_primitives::{
    address, b256, hex, keccak256, Address, Bloom, Bytes, FixedBytes, B256, B64, U256,
};

pub mod crypto;

mod signer;
pub use signer::Signer;
