use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};
use tessera_primitives::{crypto, keccak256, Address, Bytes, B256};
use tessera_types::Block;

use crate::error::InvalidMessage;

/// Protocol step within a round. Later steps compare greater, which also
/// defines the replay order of backlogged messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Step {
    Propose,
    Prevote,
    Precommit,
}

/// Wire code of a consensus message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgCode {
    Proposal = 0,
    Prevote = 1,
    Precommit = 2,
}

impl MsgCode {
    pub fn step(self) -> Step {
        match self {
            MsgCode::Proposal => Step::Propose,
            MsgCode::Prevote => Step::Prevote,
            MsgCode::Precommit => Step::Precommit,
        }
    }
}

impl Encodable for MsgCode {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        (*self as u8).encode(out)
    }

    fn length(&self) -> usize {
        (*self as u8).length()
    }
}

impl Decodable for MsgCode {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        match u8::decode(buf)? {
            0 => Ok(MsgCode::Proposal),
            1 => Ok(MsgCode::Prevote),
            2 => Ok(MsgCode::Precommit),
            _ => Err(alloy_rlp::Error::Custom("unknown message code")),
        }
    }
}

/// A prevote or precommit body. The zero hash stands for a nil vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Vote {
    pub round: u64,
    pub height: u64,
    pub proposed_block_hash: B256,
}

impl Vote {
    pub fn is_nil(&self) -> bool {
        self.proposed_block_hash.is_zero()
    }
}

/// A proposal body for one `(height, round)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proposal {
    pub round: u64,
    pub height: u64,
    /// Last round at which the block gathered a prevote quorum, if any.
    pub valid_round: Option<u64>,
    pub block: Block,
}

impl Encodable for Proposal {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        // RLP has no signed integers; an absent valid round travels as zero
        // and present rounds are shifted up by one.
        let valid_round = self.valid_round.map_or(0, |r| r + 1);
        let payload_length = self.round.length()
            + self.height.length()
            + valid_round.length()
            + self.block.length();
        alloy_rlp::Header {
            list: true,
            payload_length,
        }
        .encode(out);
        self.round.encode(out);
        self.height.encode(out);
        valid_round.encode(out);
        self.block.encode(out);
    }

    fn length(&self) -> usize {
        let valid_round = self.valid_round.map_or(0, |r| r + 1);
        let payload_length = self.round.length()
            + self.height.length()
            + valid_round.length()
            + self.block.length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Proposal {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let rlp_header = alloy_rlp::Header::decode(buf)?;
        if !rlp_header.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        let started_len = buf.len();

        let round = u64::decode(buf)?;
        let height = u64::decode(buf)?;
        let valid_round = match u64::decode(buf)? {
            0 => None,
            shifted => Some(shifted - 1),
        };
        let block = Block::decode(buf)?;

        let consumed = started_len - buf.len();
        if consumed != rlp_header.payload_length {
            return Err(alloy_rlp::Error::ListLengthMismatch {
                expected: rlp_header.payload_length,
                got: consumed,
            });
        }

        Ok(Proposal {
            round,
            height,
            valid_round,
            block,
        })
    }
}

#[derive(RlpEncodable)]
struct CommitSeal {
    block_hash: B256,
    round: u64,
    height: u64,
}

/// The bytes a precommit sender signs to produce its committed seal.
pub fn commit_seal_input(block_hash: B256, round: u64, height: u64) -> Vec<u8> {
    alloy_rlp::encode(CommitSeal {
        block_hash,
        round,
        height,
    })
}

/// Envelope of every consensus message. `payload` is the RLP-encoded typed
/// body; `signature` covers the keccak256 of the envelope with the signature
/// field emptied. Precommits additionally carry the sender's committed seal.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Message {
    pub code: MsgCode,
    pub payload: Bytes,
    pub sender: Address,
    pub signature: Bytes,
    pub committed_seal: Bytes,
}

impl Message {
    pub fn step(&self) -> Step {
        self.code.step()
    }

    pub fn decode_vote(&self) -> Result<Vote, InvalidMessage> {
        Vote::decode(&mut self.payload.as_ref()).map_err(|_| InvalidMessage::Malformed)
    }

    pub fn decode_proposal(&self) -> Result<Proposal, InvalidMessage> {
        Proposal::decode(&mut self.payload.as_ref()).map_err(|_| InvalidMessage::Malformed)
    }

    /// Decoded `(round, height)` of the typed body.
    pub fn round_and_height(&self) -> Result<(u64, u64), InvalidMessage> {
        match self.code {
            MsgCode::Proposal => {
                let proposal = self.decode_proposal()?;
                Ok((proposal.round, proposal.height))
            }
            MsgCode::Prevote | MsgCode::Precommit => {
                let vote = self.decode_vote()?;
                Ok((vote.round, vote.height))
            }
        }
    }

    /// RLP of the message with the signature emptied; the keccak256 of this
    /// is what the sender signs.
    pub fn signature_input(&self) -> Vec<u8> {
        let unsigned = Message {
            signature: Bytes::new(),
            ..self.clone()
        };
        alloy_rlp::encode(&unsigned)
    }

    /// Verifies that the signature recovers to the claimed sender.
    pub fn verify_signature(&self) -> Result<(), InvalidMessage> {
        let signature: &[u8; 65] = self
            .signature
            .as_ref()
            .try_into()
            .map_err(|_| InvalidMessage::BadSignature)?;
        let prehash = keccak256(self.signature_input());
        let recovered = crypto::recover_address_from_prehash(prehash.0, signature)
            .map_err(|_| InvalidMessage::BadSignature)?;
        if recovered != self.sender {
            return Err(InvalidMessage::BadSignature);
        }
        Ok(())
    }

    /// Verifies that a non-nil precommit's committed seal recovers to the
    /// claimed sender over `(block_hash, round, height)`.
    pub fn verify_committed_seal(&self, vote: &Vote) -> Result<(), InvalidMessage> {
        let seal: &[u8; 65] = self
            .committed_seal
            .as_ref()
            .try_into()
            .map_err(|_| InvalidMessage::BadCommittedSeal)?;
        let input = commit_seal_input(vote.proposed_block_hash, vote.round, vote.height);
        let recovered = crypto::recover_address_from_prehash(keccak256(input).0, seal)
            .map_err(|_| InvalidMessage::BadCommittedSeal)?;
        if recovered != self.sender {
            return Err(InvalidMessage::BadCommittedSeal);
        }
        Ok(())
    }
}
