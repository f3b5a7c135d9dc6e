use std::fmt::{Debug, Display};
use std::time::Duration;

use tessera_primitives::{Address, Bytes, B256};
use tessera_types::{Block, Committee};

/// Capability surface the engine uses to reach its environment: the chain,
/// the key store and the gossip layer. Every call must return promptly and
/// must never call back into the engine.
pub trait Backend: Clone + Send + Sync + 'static {
    type Error: Debug + Display + Send;

    /// This validator's address.
    fn address(&self) -> Address;

    /// Committee deciding the child of the given block.
    fn committee(&self, parent_hash: B256) -> Result<Committee, Self::Error>;

    /// ECDSA signature over `keccak256(data)`.
    fn sign(&self, data: &[u8]) -> Result<[u8; 65], Self::Error>;

    /// Static block validity. `Ok(delay)` with a non-zero delay means the
    /// block becomes valid after `delay` (its timestamp is in the future);
    /// the engine re-handles the proposal once the delay elapses.
    fn verify(&self, block: &Block) -> Result<Duration, Self::Error>;

    /// A fresh proposal body for the given height.
    fn build_block(&self, height: u64) -> Result<Block, Self::Error>;

    /// Fire-and-forget gossip of an encoded message to all committee members.
    /// Delivery order is not guaranteed.
    fn broadcast(&self, committee: &Committee, payload: Bytes);

    /// Finalizes the decided block. Must persist before returning; after it
    /// returns, `last_committed` reflects the new block.
    fn commit(
        &self,
        block: Block,
        round: u64,
        committed_seals: Vec<Bytes>,
    ) -> Result<(), Self::Error>;

    /// Latest committed block and the address of its proposer.
    fn last_committed(&self) -> (Block, Address);
}
