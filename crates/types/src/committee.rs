use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};
use tessera_primitives::Address;

/// A single validator of a committee with its voting power.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct CommitteeMember {
    pub address: Address,
    pub voting_power: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommitteeError {
    #[error("duplicate committee member {0}")]
    DuplicateMember(Address),
}

/// Ordered validator set of a single height. The order defines proposer
/// rotation: the proposer of `(height, round)` is the member at index
/// `(height + round) % len`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Committee {
    members: Vec<CommitteeMember>,
}

impl Committee {
    /// Creates a committee, rejecting duplicate addresses.
    pub fn new(members: Vec<CommitteeMember>) -> Result<Self, CommitteeError> {
        for (i, member) in members.iter().enumerate() {
            if members[..i].iter().any(|m| m.address == member.address) {
                return Err(CommitteeError::DuplicateMember(member.address));
            }
        }
        Ok(Self { members })
    }

    pub fn members(&self) -> &[CommitteeMember] {
        &self.members
    }

    pub fn member(&self, address: Address) -> Option<&CommitteeMember> {
        self.members.iter().find(|m| m.address == address)
    }

    pub fn contains(&self, address: Address) -> bool {
        self.member(address).is_some()
    }

    /// The proposer of the given height and round. The committee must not be empty.
    pub fn proposer(&self, height: u64, round: u64) -> &CommitteeMember {
        let index = height.wrapping_add(round) % self.members.len() as u64;
        &self.members[index as usize]
    }

    pub fn total_voting_power(&self) -> u64 {
        self.members.iter().map(|m| m.voting_power).sum()
    }

    /// Smallest voting power strictly greater than 2/3 of the total.
    pub fn quorum(&self) -> u64 {
        self.total_voting_power() * 2 / 3 + 1
    }

    /// Smallest voting power strictly greater than 1/3 of the total.
    /// One honest validator is guaranteed behind this much power.
    pub fn f_plus_one(&self) -> u64 {
        self.total_voting_power() / 3 + 1
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommitteeMember> {
        self.members.iter()
    }
}

impl Encodable for Committee {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.members.encode(out)
    }

    fn length(&self) -> usize {
        self.members.length()
    }
}

impl Decodable for Committee {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let members = Vec::<CommitteeMember>::decode(buf)?;
        Self::new(members).map_err(|_| alloy_rlp::Error::Custom("duplicate committee member"))
    }
}

#[cfg(test)]
mod tests {
    use tessera_primitives::Address;

    use super::{Committee, CommitteeError, CommitteeMember};

    fn member(byte: u8, power: u64) -> CommitteeMember {
        CommitteeMember {
            address: Address::repeat_byte(byte),
            voting_power: power,
        }
    }

    #[test]
    fn rejects_duplicate_addresses() {
        let err = Committee::new(vec![member(1, 1), member(2, 1), member(1, 3)]).unwrap_err();
        assert_eq!(err, CommitteeError::DuplicateMember(Address::repeat_byte(1)));
    }

    #[test]
    fn proposer_rotates_with_height_and_round() {
        let committee =
            Committee::new(vec![member(1, 1), member(2, 1), member(3, 1), member(4, 1)]).unwrap();

        assert_eq!(committee.proposer(4, 0).address, Address::repeat_byte(1));
        assert_eq!(committee.proposer(4, 1).address, Address::repeat_byte(2));
        assert_eq!(committee.proposer(5, 0).address, Address::repeat_byte(2));
        assert_eq!(committee.proposer(5, 3).address, Address::repeat_byte(1));
    }

    #[test]
    fn quorum_is_strictly_more_than_two_thirds() {
        let committee =
            Committee::new(vec![member(1, 1), member(2, 1), member(3, 1), member(4, 1)]).unwrap();
        assert_eq!(committee.total_voting_power(), 4);
        assert_eq!(committee.quorum(), 3);
        assert_eq!(committee.f_plus_one(), 2);

        // 2/3 of six is exactly four; the quorum must be strictly above it.
        let committee = Committee::new((1..=6).map(|i| member(i, 1)).collect()).unwrap();
        assert_eq!(committee.quorum(), 5);
        assert_eq!(committee.f_plus_one(), 3);
    }

    #[test]
    fn quorum_with_weighted_powers() {
        let committee = Committee::new(vec![member(1, 10), member(2, 5), member(3, 1)]).unwrap();
        assert_eq!(committee.total_voting_power(), 16);
        assert_eq!(committee.quorum(), 11);
        assert_eq!(committee.f_plus_one(), 6);
    }
}
