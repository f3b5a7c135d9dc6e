use std::collections::HashMap;
use std::sync::OnceLock;

use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};
use tessera_primitives::{keccak256, Address, Bloom, Bytes, B256, B64, U256};

use crate::{Committee, CommitteeMember};

/// Sentinel mix digest marking a header whose `extra` field carries the
/// RLP-encoded consensus extension record.
pub const BFT_DIGEST: B256 = B256::new(*b"ctical byzantine fault tolerance");

const MAX_EXTRA_SIZE: usize = 100 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("too large block number: bitlen {0}")]
    NumberOverflow(usize),
    #[error("too large block difficulty: bitlen {0}")]
    DifficultyOverflow(usize),
    #[error("too large block extradata: size {0}")]
    ExtraTooLarge(usize),
}

/// A block header.
///
/// On the wire the header always serializes as the 15-field legacy schema so
/// that tooling built for that schema keeps parsing it. When `mix_digest`
/// equals [`BFT_DIGEST`], the consensus fields are RLP-encoded and carried
/// inside the `extra` field; decoding reverses this and repopulates them.
#[derive(Debug, Default)]
pub struct Header {
    pub parent_hash: B256,
    pub uncle_hash: B256,
    pub coinbase: Address,
    pub state_root: B256,
    pub tx_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bloom,
    pub difficulty: U256,
    pub number: U256,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra: Bytes,
    pub mix_digest: B256,
    pub nonce: B64,

    /// Validator set that decided this block.
    pub committee: Committee,
    /// Signature of the proposer over [`Header::hash`].
    pub proposer_seal: Bytes,
    /// Round at which the block was committed.
    pub round: u64,
    /// Signatures of the committing quorum over `(hash, round, height)`.
    pub committed_seals: Vec<Bytes>,
    /// Seals of the previous height, kept for auditing.
    pub past_committed_seals: Vec<Bytes>,

    // Committee member lookup, lazily initialized on first use. Copies get a
    // fresh cell, so the cache never crosses an API boundary.
    committee_by_address: OnceLock<HashMap<Address, CommitteeMember>>,
}

/// The legacy wire layout. Field order is fixed; never reorder or extend it.
#[derive(RlpEncodable, RlpDecodable)]
struct LegacyHeader {
    parent_hash: B256,
    uncle_hash: B256,
    coinbase: Address,
    state_root: B256,
    tx_root: B256,
    receipts_root: B256,
    logs_bloom: Bloom,
    difficulty: U256,
    number: U256,
    gas_limit: u64,
    gas_used: u64,
    timestamp: u64,
    extra: Bytes,
    mix_digest: B256,
    nonce: B64,
}

/// Consensus extension record stored inside `extra` when BFT is in use.
#[derive(RlpEncodable, RlpDecodable)]
struct BftExtra {
    committee: Committee,
    proposer_seal: Bytes,
    round: u64,
    committed_seals: Vec<Bytes>,
    past_committed_seals: Vec<Bytes>,
}

impl Header {
    /// The header hash validators sign over.
    ///
    /// `proposer_seal` and `committed_seals` are signatures over this very
    /// hash, so the derivation blanks them before hashing; every other
    /// consensus field feeds in. Non-BFT headers hash the raw legacy layout.
    pub fn hash(&self) -> B256 {
        if self.mix_digest == BFT_DIGEST {
            let mut filtered = self.clone();
            filtered.proposer_seal = Bytes::new();
            filtered.committed_seals = Vec::new();
            keccak256(alloy_rlp::encode(&filtered))
        } else {
            keccak256(alloy_rlp::encode(self))
        }
    }

    /// Block number as `u64`. Callers must have run [`Header::sanity_check`].
    pub fn number_u64(&self) -> u64 {
        self.number.to::<u64>()
    }

    /// Rejects unbounded fields stuffed with junk data. The limits are far
    /// beyond anything sane production values can reach.
    pub fn sanity_check(&self) -> Result<(), HeaderError> {
        let number_bits = self.number.bit_len();
        if number_bits > 64 {
            return Err(HeaderError::NumberOverflow(number_bits));
        }
        let difficulty_bits = self.difficulty.bit_len();
        if difficulty_bits > 80 {
            return Err(HeaderError::DifficultyOverflow(difficulty_bits));
        }
        if self.extra.len() > MAX_EXTRA_SIZE {
            return Err(HeaderError::ExtraTooLarge(self.extra.len()));
        }
        Ok(())
    }

    /// Committee member lookup through the lazily built address map.
    pub fn committee_member(&self, address: Address) -> Option<&CommitteeMember> {
        self.committee_by_address
            .get_or_init(|| {
                self.committee
                    .iter()
                    .map(|member| (member.address, member.clone()))
                    .collect()
            })
            .get(&address)
    }

    fn legacy(&self) -> LegacyHeader {
        let extra = if self.mix_digest == BFT_DIGEST {
            let bft_extra = BftExtra {
                committee: self.committee.clone(),
                proposer_seal: self.proposer_seal.clone(),
                round: self.round,
                committed_seals: self.committed_seals.clone(),
                past_committed_seals: self.past_committed_seals.clone(),
            };
            alloy_rlp::encode(&bft_extra).into()
        } else {
            self.extra.clone()
        };

        LegacyHeader {
            parent_hash: self.parent_hash,
            uncle_hash: self.uncle_hash,
            coinbase: self.coinbase,
            state_root: self.state_root,
            tx_root: self.tx_root,
            receipts_root: self.receipts_root,
            logs_bloom: self.logs_bloom,
            difficulty: self.difficulty,
            number: self.number,
            gas_limit: self.gas_limit,
            gas_used: self.gas_used,
            timestamp: self.timestamp,
            extra,
            mix_digest: self.mix_digest,
            nonce: self.nonce,
        }
    }
}

impl Clone for Header {
    fn clone(&self) -> Self {
        Self {
            parent_hash: self.parent_hash,
            uncle_hash: self.uncle_hash,
            coinbase: self.coinbase,
            state_root: self.state_root,
            tx_root: self.tx_root,
            receipts_root: self.receipts_root,
            logs_bloom: self.logs_bloom,
            difficulty: self.difficulty,
            number: self.number,
            gas_limit: self.gas_limit,
            gas_used: self.gas_used,
            timestamp: self.timestamp,
            extra: self.extra.clone(),
            mix_digest: self.mix_digest,
            nonce: self.nonce,
            committee: self.committee.clone(),
            proposer_seal: self.proposer_seal.clone(),
            round: self.round,
            committed_seals: self.committed_seals.clone(),
            past_committed_seals: self.past_committed_seals.clone(),
            committee_by_address: OnceLock::new(),
        }
    }
}

impl PartialEq for Header {
    fn eq(&self, other: &Self) -> bool {
        self.parent_hash == other.parent_hash
            && self.uncle_hash == other.uncle_hash
            && self.coinbase == other.coinbase
            && self.state_root == other.state_root
            && self.tx_root == other.tx_root
            && self.receipts_root == other.receipts_root
            && self.logs_bloom == other.logs_bloom
            && self.difficulty == other.difficulty
            && self.number == other.number
            && self.gas_limit == other.gas_limit
            && self.gas_used == other.gas_used
            && self.timestamp == other.timestamp
            && self.extra == other.extra
            && self.mix_digest == other.mix_digest
            && self.nonce == other.nonce
            && self.committee == other.committee
            && self.proposer_seal == other.proposer_seal
            && self.round == other.round
            && self.committed_seals == other.committed_seals
            && self.past_committed_seals == other.past_committed_seals
    }
}

impl Eq for Header {}

impl Encodable for Header {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.legacy().encode(out)
    }

    fn length(&self) -> usize {
        self.legacy().length()
    }
}

impl Decodable for Header {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let legacy = LegacyHeader::decode(buf)?;

        let mut header = Header {
            parent_hash: legacy.parent_hash,
            uncle_hash: legacy.uncle_hash,
            coinbase: legacy.coinbase,
            state_root: legacy.state_root,
            tx_root: legacy.tx_root,
            receipts_root: legacy.receipts_root,
            logs_bloom: legacy.logs_bloom,
            difficulty: legacy.difficulty,
            number: legacy.number,
            gas_limit: legacy.gas_limit,
            gas_used: legacy.gas_used,
            timestamp: legacy.timestamp,
            mix_digest: legacy.mix_digest,
            nonce: legacy.nonce,
            ..Default::default()
        };

        if legacy.mix_digest == BFT_DIGEST {
            let mut extra_buf = legacy.extra.as_ref();
            let bft_extra = BftExtra::decode(&mut extra_buf)?;
            header.committee = bft_extra.committee;
            header.proposer_seal = bft_extra.proposer_seal;
            header.round = bft_extra.round;
            header.committed_seals = bft_extra.committed_seals;
            header.past_committed_seals = bft_extra.past_committed_seals;
        } else {
            header.extra = legacy.extra;
        }

        Ok(header)
    }
}
