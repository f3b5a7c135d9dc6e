use std::collections::{BTreeMap, HashMap};

use tessera_primitives::{Address, Bytes, B256};
use tracing::warn;

use crate::message::{Message, Proposal, Vote};

/// Per-height message store: one [`RoundMessages`] per round.
#[derive(Debug, Default)]
pub struct MessagesMap {
    rounds: BTreeMap<u64, RoundMessages>,
}

impl MessagesMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn round(&self, round: u64) -> Option<&RoundMessages> {
        self.rounds.get(&round)
    }

    pub fn round_mut(&mut self, round: u64) -> &mut RoundMessages {
        self.rounds.entry(round).or_default()
    }
}

/// Vote accounting for one `(height, round)`: at most one accepted proposal,
/// the prevotes and the precommits.
#[derive(Debug, Default)]
pub struct RoundMessages {
    proposal: Option<(Proposal, Message)>,
    proposal_conflicts: Vec<(Proposal, Message)>,
    prevotes: VoteSet,
    precommits: VoteSet,
}

impl RoundMessages {
    pub fn proposal(&self) -> Option<&(Proposal, Message)> {
        self.proposal.as_ref()
    }

    pub fn proposal_block_hash(&self) -> Option<B256> {
        self.proposal.as_ref().map(|(p, _)| p.block.hash())
    }

    /// Stores the proposal if none is accepted yet. A second proposal for a
    /// different block is retained as misbehavior evidence; resends of the
    /// same block are idempotent.
    pub fn set_proposal(&mut self, proposal: Proposal, msg: Message) -> bool {
        match &self.proposal {
            None => {
                self.proposal = Some((proposal, msg));
                true
            }
            Some((accepted, _)) if accepted.block.hash() == proposal.block.hash() => false,
            Some(_) => {
                warn!(
                    sender = %msg.sender,
                    round = proposal.round,
                    "conflicting proposal recorded as evidence"
                );
                self.proposal_conflicts.push((proposal, msg));
                false
            }
        }
    }

    pub fn proposal_conflicts(&self) -> &[(Proposal, Message)] {
        &self.proposal_conflicts
    }

    pub fn prevotes(&self) -> &VoteSet {
        &self.prevotes
    }

    pub fn prevotes_mut(&mut self) -> &mut VoteSet {
        &mut self.prevotes
    }

    pub fn precommits(&self) -> &VoteSet {
        &self.precommits
    }

    pub fn precommits_mut(&mut self) -> &mut VoteSet {
        &mut self.precommits
    }
}

/// Outcome of adding a vote to a [`VoteSet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddVote {
    Added,
    /// Resend of an already counted vote; ignored.
    Duplicate,
    /// A different vote from a sender that already voted; retained as
    /// evidence, power unchanged.
    Conflict,
}

/// Power-weighted votes of a single step. Each sender's voting power counts
/// once; only the first vote of a sender accrues power on its hash.
#[derive(Debug, Default)]
pub struct VoteSet {
    votes: HashMap<Address, (Vote, Message)>,
    conflicts: Vec<(Vote, Message)>,
    power_by_hash: HashMap<B256, u64>,
    total_power: u64,
}

impl VoteSet {
    pub fn add(&mut self, vote: Vote, msg: Message, power: u64) -> AddVote {
        match self.votes.get(&msg.sender) {
            Some((first, _)) if first.proposed_block_hash == vote.proposed_block_hash => {
                AddVote::Duplicate
            }
            Some(_) => {
                self.conflicts.push((vote, msg));
                AddVote::Conflict
            }
            None => {
                *self.power_by_hash.entry(vote.proposed_block_hash).or_default() += power;
                self.total_power += power;
                self.votes.insert(msg.sender, (vote, msg));
                AddVote::Added
            }
        }
    }

    /// Accumulated voting power behind the given hash.
    pub fn power(&self, hash: B256) -> u64 {
        self.power_by_hash.get(&hash).copied().unwrap_or(0)
    }

    pub fn nil_power(&self) -> u64 {
        self.power(B256::ZERO)
    }

    /// Voting power of every sender that voted at this step, regardless of value.
    pub fn total_power(&self) -> u64 {
        self.total_power
    }

    pub fn get(&self, sender: Address) -> Option<&(Vote, Message)> {
        self.votes.get(&sender)
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// A non-nil hash whose power meets the quorum, if one exists. Counting
    /// each sender once makes two quorum hashes impossible.
    pub fn quorum_hash(&self, quorum: u64) -> Option<B256> {
        self.power_by_hash
            .iter()
            .find(|(hash, power)| !hash.is_zero() && **power >= quorum)
            .map(|(hash, _)| *hash)
    }

    /// Committed seals of every counted vote for the given hash.
    pub fn seals_for(&self, hash: B256) -> Vec<Bytes> {
        self.votes
            .values()
            .filter(|(vote, msg)| {
                vote.proposed_block_hash == hash && !msg.committed_seal.is_empty()
            })
            .map(|(_, msg)| msg.committed_seal.clone())
            .collect()
    }

    /// Contradictory votes kept for misbehavior evidence.
    pub fn conflicts(&self) -> &[(Vote, Message)] {
        &self.conflicts
    }
}

#[cfg(test)]
mod tests {
    use tessera_primitives::{Address, Bytes, B256, U256};
    use tessera_types::{Block, Header, BFT_DIGEST};

    use crate::message::{Message, MsgCode, Proposal, Vote};

    use super::{AddVote, RoundMessages, VoteSet};

    fn vote_msg(sender: u8, hash: B256) -> (Vote, Message) {
        let vote = Vote {
            round: 0,
            height: 1,
            proposed_block_hash: hash,
        };
        let msg = Message {
            code: MsgCode::Prevote,
            payload: alloy_rlp::encode(vote).into(),
            sender: Address::repeat_byte(sender),
            signature: Bytes::new(),
            committed_seal: Bytes::new(),
        };
        (vote, msg)
    }

    #[test]
    fn power_counts_each_sender_once() {
        let hash = B256::repeat_byte(1);
        let mut votes = VoteSet::default();

        let (vote, msg) = vote_msg(1, hash);
        assert_eq!(votes.add(vote, msg, 2), AddVote::Added);
        let (vote, msg) = vote_msg(1, hash);
        assert_eq!(votes.add(vote, msg, 2), AddVote::Duplicate);

        assert_eq!(votes.power(hash), 2);
        assert_eq!(votes.total_power(), 2);
        assert_eq!(votes.len(), 1);
    }

    #[test]
    fn conflicting_votes_are_evidence_only() {
        let mut votes = VoteSet::default();

        let (vote, msg) = vote_msg(1, B256::repeat_byte(1));
        votes.add(vote, msg, 1);
        let (vote, msg) = vote_msg(1, B256::repeat_byte(2));
        assert_eq!(votes.add(vote, msg, 1), AddVote::Conflict);

        // Only the first vote counts toward quorum on its hash.
        assert_eq!(votes.power(B256::repeat_byte(1)), 1);
        assert_eq!(votes.power(B256::repeat_byte(2)), 0);
        assert_eq!(votes.total_power(), 1);
        assert_eq!(votes.conflicts().len(), 1);
    }

    #[test]
    fn quorum_detection() {
        let hash = B256::repeat_byte(3);
        let mut votes = VoteSet::default();
        for sender in 1..=3 {
            let (vote, msg) = vote_msg(sender, hash);
            votes.add(vote, msg, 1);
        }
        let (vote, msg) = vote_msg(4, B256::ZERO);
        votes.add(vote, msg, 1);

        assert_eq!(votes.quorum_hash(3), Some(hash));
        assert_eq!(votes.quorum_hash(4), None);
        assert_eq!(votes.nil_power(), 1);
        assert_eq!(votes.total_power(), 4);
    }

    #[test]
    fn conflicting_proposals_are_evidence() {
        let proposer = Address::repeat_byte(0x11);
        let proposal_for = |timestamp: u64| {
            let mut header = Header::default();
            header.number = U256::from(1);
            header.timestamp = timestamp;
            header.mix_digest = BFT_DIGEST;
            let block = Block::new(header, vec![], vec![]);
            let proposal = Proposal {
                round: 0,
                height: 1,
                valid_round: None,
                block,
            };
            let msg = Message {
                code: MsgCode::Proposal,
                payload: alloy_rlp::encode(&proposal).into(),
                sender: proposer,
                signature: Bytes::new(),
                committed_seal: Bytes::new(),
            };
            (proposal, msg)
        };

        let mut round_messages = RoundMessages::default();
        let (first, msg) = proposal_for(1);
        assert!(round_messages.set_proposal(first.clone(), msg));

        // A resend of the same block is idempotent.
        let (resend, msg) = proposal_for(1);
        assert!(!round_messages.set_proposal(resend, msg));
        assert!(round_messages.proposal_conflicts().is_empty());

        // A different block for the same view is kept as evidence; the first
        // accepted proposal stays in place.
        let (conflicting, msg) = proposal_for(2);
        assert!(!round_messages.set_proposal(conflicting, msg));
        assert_eq!(round_messages.proposal_conflicts().len(), 1);
        assert_eq!(round_messages.proposal_block_hash(), Some(first.block.hash()));
    }

    #[test]
    fn seals_are_collected_per_hash() {
        let hash = B256::repeat_byte(4);
        let mut votes = VoteSet::default();

        let (vote, mut msg) = vote_msg(1, hash);
        msg.code = MsgCode::Precommit;
        msg.committed_seal = Bytes::from(vec![1; 65]);
        votes.add(vote, msg, 1);

        let (vote, mut msg) = vote_msg(2, B256::ZERO);
        msg.code = MsgCode::Precommit;
        votes.add(vote, msg, 1);

        assert_eq!(votes.seals_for(hash).len(), 1);
        assert!(votes.seals_for(B256::ZERO).is_empty());
    }
}
